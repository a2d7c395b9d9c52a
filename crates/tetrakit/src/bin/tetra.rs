//! Command-line surface over the adaptation core.

use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use tetrakit::comm::Comm;
use tetrakit::error::{Error, Result};
use tetrakit::part;

fn usage(name: &str) {
    println!("usage:\n {name} [--help] <command> [<args>]");
    println!();
    println!("commands:");
    println!("  bootstrap Create an initial grid from an EGADS file");
    println!("  fill      Fill a surface shell mesh with a volume");
    println!("  location  Report the locations of vertices in the mesh");
}

fn bootstrap_help(name: &str) {
    println!("usage:\n {name} bootstrap project.egads");
    println!();
}

fn fill_help(name: &str) {
    println!("usage:\n {name} fill surface.meshb volume.meshb");
    println!();
}

fn location_help(name: &str) {
    println!("usage:\n {name} location input.meshb node_index node_index ...");
    println!("  node_index is zero-based");
    println!();
}

fn bootstrap(args: &[String]) -> Result<()> {
    let Some(project) = args.first() else {
        return Err(Error::Null("bootstrap needs a project.egads".to_string()));
    };
    if !project.ends_with(".egads") {
        return Err(Error::Invalid(format!("{project} is not an .egads file")));
    }
    Err(Error::Implement(
        "bootstrap requires the external CAD kernel".to_string(),
    ))
}

fn fill(args: &[String]) -> Result<()> {
    if args.len() < 2 {
        return Err(Error::Null("fill needs input and output meshes".to_string()));
    }
    Err(Error::Implement(
        "fill requires the external tetrahedralizer".to_string(),
    ))
}

fn location(args: &[String]) -> Result<()> {
    let Some(in_file) = args.first() else {
        return Err(Error::Null("location needs an input mesh".to_string()));
    };
    println!("import {in_file}");
    let grid = part::read_by_extension(Arc::new(Comm::solo()), Path::new(in_file))?;
    for token in &args[1..] {
        let global: i64 = token
            .parse()
            .map_err(|_| Error::Invalid(format!("node index {token}")))?;
        println!("global index {global}");
        let local = grid.nodes.local(global)?;
        println!("{}", grid.nodes.location(local));
    }
    Ok(())
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = std::env::args().collect();
    let name = args.first().map(String::as_str).unwrap_or("tetra");
    let wants_help = args.iter().any(|arg| arg == "--help" || arg == "-h");

    let Some(command) = args.get(1).filter(|c| !c.starts_with('-')) else {
        usage(name);
        return if wants_help {
            ExitCode::SUCCESS
        } else {
            ExitCode::FAILURE
        };
    };

    let rest = &args[2..];
    let outcome = match command.chars().next() {
        Some('b') => {
            if wants_help {
                bootstrap_help(name);
                return ExitCode::SUCCESS;
            }
            bootstrap(rest)
        }
        Some('f') => {
            if wants_help {
                fill_help(name);
                return ExitCode::SUCCESS;
            }
            fill(rest)
        }
        Some('l') => {
            if wants_help {
                location_help(name);
                return ExitCode::SUCCESS;
            }
            location(rest)
        }
        _ => {
            usage(name);
            return ExitCode::FAILURE;
        }
    };

    match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{name} {command}: {err}");
            ExitCode::FAILURE
        }
    }
}
