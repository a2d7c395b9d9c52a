//! Partitioned streaming mesh I/O.
//!
//! Rank 0 owns the file handle and reads section-size chunks; each record is
//! classified by destination partition (vertices by implicit part, cells by
//! their first node's implicit part, geometry records by their vertex) and
//! shipped with one blindsend per chunk. Vertex indices are 1-based on disk
//! and 0-based in memory.
//!
//! Formats: UGRID volume meshes (`.lb8.ugrid` little endian, `.b8.ugrid`
//! byte swapped), a keyword-sectioned binary (`.meshb`) carrying geometry
//! records and an opaque CAD blob, and keyword-62 solution files (`.solb`)
//! for metrics (type 3, transposed off-diagonal order) and scalars (type 1).

use std::fs::File;
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Arc;

use crate::cell::CellKind;
use crate::comm::Comm;
use crate::error::{Error, Result};
use crate::geom::GeomKind;
use crate::grid::Grid;
use crate::migrate;

const KEYWORD_DIMENSION: i32 = 3;
const KEYWORD_VERTEX: i32 = 4;
const KEYWORD_EDGE: i32 = 5;
const KEYWORD_TRIANGLE: i32 = 6;
const KEYWORD_TETRAHEDRON: i32 = 8;
const KEYWORD_GEOM_BASE: i32 = 41;
const KEYWORD_SOLUTION: i32 = 62;
const KEYWORD_CAD_DATA: i32 = 126;

const SOLUTION_SCALAR: i32 = 1;
const SOLUTION_SYM_MAT: i32 = 3;

/// First global id of `part` under the implicit balanced split.
pub fn part_first(total: i64, nparts: usize, part: usize) -> i64 {
    let n = nparts as i64;
    let size = (total + n - 1) / n;
    (part as i64 * size).min(total)
}

/// The partition implicitly owning `index`.
pub fn part_implicit(total: i64, nparts: usize, index: i64) -> usize {
    let n = nparts as i64;
    let size = (total + n - 1) / n;
    (index / size) as usize
}

fn chunk_size(total: i64, nparts: usize) -> i64 {
    1_000_000i64.max(total / nparts as i64).min(total).max(1)
}

fn metric_chunk_size(total: i64, nparts: usize) -> i64 {
    100_000i64.max(total / nparts as i64).min(total).max(1)
}

/// Rank 0's file handle with optional byte swapping.
struct ByteFile {
    file: File,
    swap: bool,
}

impl ByteFile {
    fn open(path: &Path, swap: bool) -> Result<ByteFile> {
        let file = File::open(path)
            .map_err(|err| Error::Null(format!("unable to open {}: {err}", path.display())))?;
        Ok(ByteFile { file, swap })
    }

    fn read_i32(&mut self) -> Result<i32> {
        let mut bytes = [0u8; 4];
        self.file.read_exact(&mut bytes)?;
        if self.swap {
            bytes.reverse();
        }
        Ok(i32::from_le_bytes(bytes))
    }

    fn read_f64(&mut self) -> Result<f64> {
        let mut bytes = [0u8; 8];
        self.file.read_exact(&mut bytes)?;
        if self.swap {
            bytes.reverse();
        }
        Ok(f64::from_le_bytes(bytes))
    }

    fn read_bytes(&mut self, n: usize) -> Result<Vec<u8>> {
        let mut bytes = vec![0u8; n];
        self.file.read_exact(&mut bytes)?;
        Ok(bytes)
    }

    fn seek(&mut self, offset: u64) -> Result<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        Ok(())
    }

    fn position(&mut self) -> Result<u64> {
        Ok(self.file.stream_position()?)
    }
}

// -- chunked vertex / cell / geometry delivery ----------------------------

/// Stream `nnode` vertices from rank 0 to their implicit partitions. The
/// on-disk record is (x, y, z) plus an optional trailing id.
fn stream_nodes(
    comm: &Comm,
    file: &mut Option<ByteFile>,
    grid: &mut Grid,
    nnode: i64,
    has_id: bool,
) -> Result<()> {
    grid.nodes.initialize_n_global(nnode);
    let chunk = chunk_size(nnode, comm.size());
    let mut nread = 0i64;
    while nread < nnode {
        let section = chunk.min(nnode - nread) as usize;
        let mut dest = vec![0usize; 0];
        let mut xyz = vec![0.0f64; 0];
        let mut globals = vec![0i64; 0];
        if let Some(file) = file.as_mut() {
            dest.reserve(section);
            xyz.reserve(3 * section);
            globals.reserve(section);
            for slot in 0..section {
                let global = nread + slot as i64;
                let x = file.read_f64()?;
                let y = file.read_f64()?;
                let z = file.read_f64()?;
                if has_id {
                    file.read_i32()?;
                }
                dest.push(part_implicit(nnode, comm.size(), global));
                globals.push(global);
                xyz.extend_from_slice(&[x, y, z]);
            }
        }
        let got_globals = comm.blindsend_ints(&dest, &globals, 1);
        let got_xyz = comm.blindsend_dbls(&dest, &xyz, 3);
        for (slot, &global) in got_globals.iter().enumerate() {
            let local = grid.nodes.add(global)?;
            grid.nodes
                .set_xyz(local, [got_xyz[3 * slot], got_xyz[3 * slot + 1], got_xyz[3 * slot + 2]]);
        }
        nread += section as i64;
    }
    Ok(())
}

/// Stream one cell section. `id_reader` pulls the trailing surface id for
/// boundary kinds, either inline or from a separate file region.
fn stream_cells(
    comm: &Comm,
    grid: &mut Grid,
    kind: CellKind,
    ncell: i64,
    nnode: i64,
    mut read_cell: impl FnMut(usize) -> Result<(Vec<i64>, i64)>,
) -> Result<()> {
    let node_per = kind.node_per();
    let chunk = chunk_size(ncell, comm.size());
    let mut nread = 0i64;
    while nread < ncell {
        let section = chunk.min(ncell - nread) as usize;
        let mut dest = Vec::new();
        let mut conn = Vec::new();
        let mut ids = Vec::new();
        if comm.once() {
            for slot in 0..section {
                let (nodes, id) = read_cell(slot)?;
                dest.push(part_implicit(nnode, comm.size(), nodes[0]));
                conn.extend_from_slice(&nodes);
                ids.push(id);
            }
        }
        let got_conn = comm.blindsend_ints(&dest, &conn, node_per);
        let got_ids = comm.blindsend_ints(&dest, &ids, 1);
        for (slot, &id) in got_ids.iter().enumerate() {
            let globals = &got_conn[node_per * slot..node_per * (slot + 1)];
            let mut locals = Vec::with_capacity(node_per);
            for &global in globals {
                let local = grid.nodes.add(global)?;
                // freshly ghosted nodes belong to their implicit part
                grid.nodes
                    .set_part(local, part_implicit(nnode, comm.size(), global));
                locals.push(local);
            }
            grid.add_cell(kind, &locals, id)?;
        }
        nread += section as i64;
    }
    Ok(())
}

/// Stream one geometry-record section to the records' vertex partitions.
fn stream_geom(
    comm: &Comm,
    file: &mut Option<ByteFile>,
    grid: &mut Grid,
    kind: GeomKind,
    ngeom: i64,
    nnode: i64,
) -> Result<()> {
    let chunk = chunk_size(ngeom, comm.size());
    let mut nread = 0i64;
    while nread < ngeom {
        let section = chunk.min(ngeom - nread) as usize;
        let mut dest = Vec::new();
        let mut ints = Vec::new();
        let mut params = Vec::new();
        if let Some(file) = file.as_mut() {
            for _slot in 0..section {
                let node = i64::from(file.read_i32()?) - 1;
                let id = i64::from(file.read_i32()?);
                let mut param = [0.0f64; 2];
                for value in param.iter_mut().take(kind.param_count()) {
                    *value = file.read_f64()?;
                }
                if kind.param_count() > 0 {
                    file.read_f64()?; // filler
                }
                dest.push(part_implicit(nnode, comm.size(), node));
                ints.extend_from_slice(&[node, id]);
                params.extend_from_slice(&param);
            }
        }
        let got_ints = comm.blindsend_ints(&dest, &ints, 2);
        let got_params = comm.blindsend_dbls(&dest, &params, 2);
        for slot in 0..got_ints.len() / 2 {
            let local = grid.nodes.local(got_ints[2 * slot])?;
            let param = [got_params[2 * slot], got_params[2 * slot + 1]];
            grid.geom.add(local, kind, got_ints[2 * slot + 1], &param)?;
        }
        nread += section as i64;
    }
    Ok(())
}

// -- UGRID ----------------------------------------------------------------

/// Read a seven-count binary UGRID volume mesh.
pub fn read_ugrid(comm: Arc<Comm>, path: &Path, swap_endian: bool) -> Result<Grid> {
    let mut grid = Grid::create_shared(comm);
    let comm = Arc::clone(&grid.comm);

    let mut file = if comm.once() {
        Some(ByteFile::open(path, swap_endian)?)
    } else {
        None
    };

    let mut counts = [0i64; 7];
    if let Some(file) = file.as_mut() {
        for count in &mut counts {
            *count = i64::from(file.read_i32()?);
        }
    }
    comm.bcast_ints(&mut counts);
    let [nnode, ntri, nqua, ntet, npyr, npri, nhex] = counts;

    if ntet == 0 && npyr == 0 && (npri != 0 || nhex != 0) {
        grid.twod = true;
    }

    stream_nodes(&comm, &mut file, &mut grid, nnode, false)?;

    // section offsets in bytes; boundary ids trail both face sections
    let header = 4 * 7;
    let xyz_bytes = 8 * 3 * nnode;
    let tri_conn = header + xyz_bytes;
    let qua_conn = tri_conn + 4 * 3 * ntri;
    let face_ids = qua_conn + 4 * 4 * nqua;
    let tet_conn = face_ids + 4 * (ntri + nqua);
    let pyr_conn = tet_conn + 4 * 4 * ntet;
    let pri_conn = pyr_conn + 4 * 5 * npyr;
    let hex_conn = pri_conn + 4 * 6 * npri;

    let sections: [(CellKind, i64, i64, Option<i64>); 6] = [
        (CellKind::Tri, ntri, tri_conn, Some(face_ids)),
        (CellKind::Qua, nqua, qua_conn, Some(face_ids + 4 * ntri)),
        (CellKind::Tet, ntet, tet_conn, None),
        (CellKind::Pyr, npyr, pyr_conn, None),
        (CellKind::Pri, npri, pri_conn, None),
        (CellKind::Hex, nhex, hex_conn, None),
    ];
    for (kind, ncell, conn_offset, id_offset) in sections {
        if ncell == 0 {
            continue;
        }
        let node_per = kind.node_per();
        let mut cells_read = 0i64;
        stream_cells(&comm, &mut grid, kind, ncell, nnode, |_slot| {
            let file = file
                .as_mut()
                .ok_or_else(|| Error::Null("cell read off rank 0".to_string()))?;
            file.seek((conn_offset + 4 * node_per as i64 * cells_read) as u64)?;
            let mut nodes = Vec::with_capacity(node_per);
            for _ in 0..node_per {
                nodes.push(i64::from(file.read_i32()?) - 1);
            }
            let id = match id_offset {
                Some(id_offset) => {
                    file.seek((id_offset + 4 * cells_read) as u64)?;
                    i64::from(file.read_i32()?)
                }
                None => 0,
            };
            cells_read += 1;
            Ok((nodes, id))
        })?;
    }

    migrate::shuffle(&mut grid)?;
    grid.nodes.ghost_real(&comm)?;
    Ok(grid)
}

// -- keyword-sectioned binary ---------------------------------------------

/// Scan the section directory: keyword to (payload offset, next offset).
fn scan_sections(file: &mut ByteFile) -> Result<Vec<(i32, u64, u64)>> {
    let mut directory = Vec::new();
    file.seek(0)?;
    loop {
        let position = file.position()?;
        let keyword = match file.read_i32() {
            Ok(keyword) => keyword,
            Err(_) => break, // end of file
        };
        let next = file.read_i32()?;
        directory.push((keyword, position + 8, next as u64));
        if next == 0 {
            break;
        }
        file.seek(next as u64)?;
    }
    Ok(directory)
}

fn jump_to(
    file: &mut Option<ByteFile>,
    directory: &[(i32, u64, u64)],
    keyword: i32,
) -> Result<bool> {
    let Some(file) = file.as_mut() else {
        return Ok(false);
    };
    match directory.iter().find(|&&(kw, _, _)| kw == keyword) {
        Some(&(_, payload, _)) => {
            file.seek(payload)?;
            Ok(true)
        }
        None => Ok(false),
    }
}

/// Read the keyword-sectioned binary mesh: vertices, edges, triangles,
/// tetrahedra, per-kind geometry records, and the CAD byte blob.
pub fn read_meshb(comm: Arc<Comm>, path: &Path) -> Result<Grid> {
    let mut grid = Grid::create_shared(comm);
    let comm = Arc::clone(&grid.comm);

    let mut file = if comm.once() {
        Some(ByteFile::open(path, false)?)
    } else {
        None
    };
    let directory = match file.as_mut() {
        Some(file) => scan_sections(file)?,
        None => Vec::new(),
    };

    let mut dim = [0i64];
    if jump_to(&mut file, &directory, KEYWORD_DIMENSION)? {
        dim[0] = i64::from(file.as_mut().unwrap().read_i32()?);
    }
    comm.bcast_ints(&mut dim);
    if dim[0] != 3 {
        return Err(Error::Implement(format!("{}D meshb", dim[0])));
    }

    let mut nnode = [0i64];
    if jump_to(&mut file, &directory, KEYWORD_VERTEX)? {
        nnode[0] = i64::from(file.as_mut().unwrap().read_i32()?);
    }
    comm.bcast_ints(&mut nnode);
    let nnode = nnode[0];
    if nnode == 0 {
        return Err(Error::Null("meshb missing vertex section".to_string()));
    }
    stream_nodes(&comm, &mut file, &mut grid, nnode, true)?;

    for (keyword, kind) in [
        (KEYWORD_TETRAHEDRON, CellKind::Tet),
        (KEYWORD_TRIANGLE, CellKind::Tri),
        (KEYWORD_EDGE, CellKind::Edg),
    ] {
        let mut ncell = [0i64];
        if jump_to(&mut file, &directory, keyword)? {
            ncell[0] = i64::from(file.as_mut().unwrap().read_i32()?);
        }
        comm.bcast_ints(&mut ncell);
        if ncell[0] == 0 {
            continue;
        }
        let node_per = kind.node_per();
        stream_cells(&comm, &mut grid, kind, ncell[0], nnode, |_slot| {
            let file = file
                .as_mut()
                .ok_or_else(|| Error::Null("cell read off rank 0".to_string()))?;
            let mut nodes = Vec::with_capacity(node_per);
            for _ in 0..node_per {
                nodes.push(i64::from(file.read_i32()?) - 1);
            }
            // every meshb element carries a trailing reference
            let id = i64::from(file.read_i32()?);
            Ok((nodes, id))
        })?;
    }

    for kind in GeomKind::ALL {
        let keyword = KEYWORD_GEOM_BASE + kind.index() as i32;
        let mut ngeom = [0i64];
        if jump_to(&mut file, &directory, keyword)? {
            ngeom[0] = i64::from(file.as_mut().unwrap().read_i32()?);
        }
        comm.bcast_ints(&mut ngeom);
        if ngeom[0] > 0 {
            stream_geom(&comm, &mut file, &mut grid, kind, ngeom[0], nnode)?;
        }
    }

    let mut cad_bytes = [0i64];
    if jump_to(&mut file, &directory, KEYWORD_CAD_DATA)? {
        cad_bytes[0] = i64::from(file.as_mut().unwrap().read_i32()?);
    }
    comm.bcast_ints(&mut cad_bytes);
    if cad_bytes[0] > 0 {
        let mut blob = vec![0i64; cad_bytes[0] as usize];
        if let Some(file) = file.as_mut() {
            for (slot, byte) in file.read_bytes(cad_bytes[0] as usize)?.iter().enumerate() {
                blob[slot] = i64::from(*byte);
            }
        }
        comm.bcast_ints(&mut blob);
        grid.cad_data = blob.into_iter().map(|b| b as u8).collect();
    }

    migrate::shuffle(&mut grid)?;
    grid.geom.ghost(&comm, &grid.nodes)?;
    grid.nodes.ghost_real(&comm)?;
    Ok(grid)
}

// -- solution files --------------------------------------------------------

fn solution_header(
    comm: &Comm,
    file: &mut Option<ByteFile>,
    directory: &[(i32, u64, u64)],
    expected_type: i32,
    n_global: i64,
) -> Result<()> {
    let mut header = [0i64; 3];
    if jump_to(file, directory, KEYWORD_SOLUTION)? {
        let file = file.as_mut().unwrap();
        header[0] = i64::from(file.read_i32()?);
        header[1] = i64::from(file.read_i32()?);
        header[2] = i64::from(file.read_i32()?);
    } else if comm.once() {
        return Err(Error::Null("solution section missing".to_string()));
    }
    comm.bcast_ints(&mut header);
    if header[0] != n_global {
        return Err(Error::Invalid(format!(
            "solution for {} vertices, mesh has {n_global}",
            header[0]
        )));
    }
    if header[1] != 1 {
        return Err(Error::Implement(format!("{} solution fields", header[1])));
    }
    if header[2] != i64::from(expected_type) {
        return Err(Error::Invalid(format!(
            "solution type {} where {expected_type} expected",
            header[2]
        )));
    }
    Ok(())
}

/// Read a keyword-62 type-3 metric and apply it to matching local vertices.
/// The file order (m11, m12, m22, m13, m23, m33) transposes the in-memory
/// off-diagonals; the mapping here must stay exact.
pub fn read_metric(grid: &mut Grid, path: &Path) -> Result<()> {
    let comm = Arc::clone(&grid.comm);
    let mut file = if comm.once() {
        Some(ByteFile::open(path, false)?)
    } else {
        None
    };
    let directory = match file.as_mut() {
        Some(file) => scan_sections(file)?,
        None => Vec::new(),
    };
    solution_header(&comm, &mut file, &directory, SOLUTION_SYM_MAT, grid.nodes.n_global())?;

    let n_global = grid.nodes.n_global();
    let chunk = metric_chunk_size(n_global, comm.size());
    let mut nread = 0i64;
    while nread < n_global {
        let section = chunk.min(n_global - nread) as usize;
        let mut values = vec![0.0f64; 6 * section];
        if let Some(file) = file.as_mut() {
            for slot in 0..section {
                values[6 * slot] = file.read_f64()?; // m11
                values[6 * slot + 1] = file.read_f64()?; // m12
                values[6 * slot + 3] = file.read_f64()?; // m22, transposed
                values[6 * slot + 2] = file.read_f64()?; // m13
                values[6 * slot + 4] = file.read_f64()?; // m23
                values[6 * slot + 5] = file.read_f64()?; // m33
            }
        }
        comm.bcast_dbls(&mut values);
        for slot in 0..section {
            let global = nread + slot as i64;
            if let Ok(local) = grid.nodes.local(global) {
                let mut m = [0.0; 6];
                m.copy_from_slice(&values[6 * slot..6 * slot + 6]);
                grid.nodes.metric_set(local, &m)?;
            }
        }
        nread += section as i64;
    }
    Ok(())
}

/// Read a keyword-62 type-1 scalar field into a per-slot vector.
pub fn read_scalar(grid: &Grid, path: &Path) -> Result<Vec<f64>> {
    let comm = Arc::clone(&grid.comm);
    let mut file = if comm.once() {
        Some(ByteFile::open(path, false)?)
    } else {
        None
    };
    let directory = match file.as_mut() {
        Some(file) => scan_sections(file)?,
        None => Vec::new(),
    };
    solution_header(&comm, &mut file, &directory, SOLUTION_SCALAR, grid.nodes.n_global())?;

    let n_global = grid.nodes.n_global();
    let mut scalar = vec![0.0; grid.nodes.max()];
    let chunk = metric_chunk_size(n_global, comm.size());
    let mut nread = 0i64;
    while nread < n_global {
        let section = chunk.min(n_global - nread) as usize;
        let mut values = vec![0.0f64; section];
        if let Some(file) = file.as_mut() {
            for value in values.iter_mut() {
                *value = file.read_f64()?;
            }
        }
        comm.bcast_dbls(&mut values);
        for (slot, &value) in values.iter().enumerate() {
            let global = nread + slot as i64;
            if let Ok(local) = grid.nodes.local(global) {
                scalar[local] = value;
            }
        }
        nread += section as i64;
    }
    Ok(scalar)
}

// -- writers ---------------------------------------------------------------

struct ByteSink {
    sink: BufWriter<File>,
    swap: bool,
}

impl ByteSink {
    fn create(path: &Path, swap: bool) -> Result<ByteSink> {
        let file = File::create(path)
            .map_err(|err| Error::Null(format!("unable to create {}: {err}", path.display())))?;
        Ok(ByteSink {
            sink: BufWriter::new(file),
            swap,
        })
    }

    fn write_i32(&mut self, value: i32) -> Result<()> {
        let mut bytes = value.to_le_bytes();
        if self.swap {
            bytes.reverse();
        }
        self.sink.write_all(&bytes)?;
        Ok(())
    }

    fn write_f64(&mut self, value: f64) -> Result<()> {
        let mut bytes = value.to_le_bytes();
        if self.swap {
            bytes.reverse();
        }
        self.sink.write_all(&bytes)?;
        Ok(())
    }

    fn finish(mut self) -> Result<()> {
        self.sink.flush()?;
        Ok(())
    }
}

/// Owned vertices gathered to rank 0 in global order as (global, xyz).
fn gather_nodes(grid: &Grid) -> Result<Vec<(i64, [f64; 3])>> {
    let comm = &grid.comm;
    let mut dest = Vec::new();
    let mut globals = Vec::new();
    let mut xyz = Vec::new();
    for node in grid.nodes.iter_valid() {
        if grid.nodes.owned(node) {
            dest.push(0);
            globals.push(grid.nodes.global(node));
            xyz.extend_from_slice(grid.nodes.xyz(node));
        }
    }
    let got_globals = comm.blindsend_ints(&dest, &globals, 1);
    let got_xyz = comm.blindsend_dbls(&dest, &xyz, 3);
    let mut nodes: Vec<(i64, [f64; 3])> = got_globals
        .iter()
        .enumerate()
        .map(|(slot, &global)| {
            (
                global,
                [got_xyz[3 * slot], got_xyz[3 * slot + 1], got_xyz[3 * slot + 2]],
            )
        })
        .collect();
    nodes.sort_by_key(|&(global, _)| global);
    Ok(nodes)
}

/// Owned cells gathered to rank 0 as global connectivities plus surface id,
/// sorted for a stable on-disk order.
fn gather_cells(grid: &Grid, kind: CellKind) -> Result<Vec<(Vec<i64>, i64)>> {
    let comm = &grid.comm;
    let node_per = kind.node_per();
    let table = grid.cells(kind);
    let mut dest = Vec::new();
    let mut conn = Vec::new();
    let mut ids = Vec::new();
    for cell in table.valid_cells() {
        if grid.cell_owner(kind, cell)? != comm.rank() {
            continue;
        }
        dest.push(0);
        for &node in table.nodes_of(cell)? {
            conn.push(grid.nodes.global(node));
        }
        ids.push(table.surface_id(cell)?);
    }
    let got_conn = comm.blindsend_ints(&dest, &conn, node_per);
    let got_ids = comm.blindsend_ints(&dest, &ids, 1);
    let mut cells: Vec<(Vec<i64>, i64)> = got_ids
        .iter()
        .enumerate()
        .map(|(slot, &id)| (got_conn[node_per * slot..node_per * (slot + 1)].to_vec(), id))
        .collect();
    cells.sort();
    Ok(cells)
}

/// Write the volume mesh as binary UGRID; a collective, rank 0 writes.
pub fn write_ugrid(grid: &Grid, path: &Path, swap_endian: bool) -> Result<()> {
    let nodes = gather_nodes(grid)?;
    let tri = gather_cells(grid, CellKind::Tri)?;
    let qua = gather_cells(grid, CellKind::Qua)?;
    let tet = gather_cells(grid, CellKind::Tet)?;
    let pyr = gather_cells(grid, CellKind::Pyr)?;
    let pri = gather_cells(grid, CellKind::Pri)?;
    let hex = gather_cells(grid, CellKind::Hex)?;
    if !grid.comm.once() {
        return Ok(());
    }

    let mut sink = ByteSink::create(path, swap_endian)?;
    for count in [
        nodes.len(),
        tri.len(),
        qua.len(),
        tet.len(),
        pyr.len(),
        pri.len(),
        hex.len(),
    ] {
        sink.write_i32(count as i32)?;
    }
    for (_, xyz) in &nodes {
        for &value in xyz {
            sink.write_f64(value)?;
        }
    }
    for section in [&tri, &qua] {
        for (conn, _) in section.iter() {
            for &node in conn {
                sink.write_i32(node as i32 + 1)?;
            }
        }
    }
    for section in [&tri, &qua] {
        for (_, id) in section.iter() {
            sink.write_i32(*id as i32)?;
        }
    }
    for section in [&tet, &pyr, &pri, &hex] {
        for (conn, _) in section.iter() {
            for &node in conn {
                sink.write_i32(node as i32 + 1)?;
            }
        }
    }
    sink.finish()
}

/// Write the keyword-sectioned binary mesh; a collective, rank 0 writes.
pub fn write_meshb(grid: &Grid, path: &Path) -> Result<()> {
    let nodes = gather_nodes(grid)?;
    let tet = gather_cells(grid, CellKind::Tet)?;
    let tri = gather_cells(grid, CellKind::Tri)?;
    let edg = gather_cells(grid, CellKind::Edg)?;
    let mut geom: [Vec<(i64, i64, [f64; 2])>; 3] = [Vec::new(), Vec::new(), Vec::new()];
    {
        let comm = &grid.comm;
        for kind in GeomKind::ALL {
            let mut dest = Vec::new();
            let mut ints = Vec::new();
            let mut params = Vec::new();
            for node in grid.nodes.iter_valid() {
                if !grid.nodes.owned(node) {
                    continue;
                }
                for record in grid.geom.records_of(node) {
                    if record.kind != kind {
                        continue;
                    }
                    dest.push(0);
                    ints.extend_from_slice(&[grid.nodes.global(node), record.id]);
                    params.extend_from_slice(&record.param);
                }
            }
            let got_ints = comm.blindsend_ints(&dest, &ints, 2);
            let got_params = comm.blindsend_dbls(&dest, &params, 2);
            for slot in 0..got_ints.len() / 2 {
                geom[kind.index()].push((
                    got_ints[2 * slot],
                    got_ints[2 * slot + 1],
                    [got_params[2 * slot], got_params[2 * slot + 1]],
                ));
            }
            geom[kind.index()].sort_by_key(|&(node, id, _)| (node, id));
        }
    }
    if !grid.comm.once() {
        return Ok(());
    }

    let mut sink = ByteSink::create(path, false)?;
    let mut position = 0i32;
    let mut begin = |sink: &mut ByteSink, keyword: i32, payload: i32| -> Result<()> {
        position += 8 + payload;
        sink.write_i32(keyword)?;
        sink.write_i32(position)?;
        Ok(())
    };

    begin(&mut sink, KEYWORD_DIMENSION, 4)?;
    sink.write_i32(3)?;

    begin(&mut sink, KEYWORD_VERTEX, 4 + nodes.len() as i32 * (3 * 8 + 4))?;
    sink.write_i32(nodes.len() as i32)?;
    for (_, xyz) in &nodes {
        for &value in xyz {
            sink.write_f64(value)?;
        }
        sink.write_i32(0)?;
    }

    for (keyword, kind, cells) in [
        (KEYWORD_EDGE, CellKind::Edg, &edg),
        (KEYWORD_TRIANGLE, CellKind::Tri, &tri),
        (KEYWORD_TETRAHEDRON, CellKind::Tet, &tet),
    ] {
        if cells.is_empty() {
            continue;
        }
        let record = 4 * (kind.node_per() as i32 + 1);
        begin(&mut sink, keyword, 4 + cells.len() as i32 * record)?;
        sink.write_i32(cells.len() as i32)?;
        for (conn, id) in cells.iter() {
            for &node in conn {
                sink.write_i32(node as i32 + 1)?;
            }
            sink.write_i32(*id as i32)?;
        }
    }

    for kind in GeomKind::ALL {
        let records = &geom[kind.index()];
        if records.is_empty() {
            continue;
        }
        let with_params = if kind.param_count() > 0 {
            8 * (kind.param_count() as i32 + 1)
        } else {
            0
        };
        begin(
            &mut sink,
            KEYWORD_GEOM_BASE + kind.index() as i32,
            4 + records.len() as i32 * (8 + with_params),
        )?;
        sink.write_i32(records.len() as i32)?;
        for (node, id, param) in records.iter() {
            sink.write_i32(*node as i32 + 1)?;
            sink.write_i32(*id as i32)?;
            for value in param.iter().take(kind.param_count()) {
                sink.write_f64(*value)?;
            }
            if kind.param_count() > 0 {
                sink.write_f64(0.0)?; // filler
            }
        }
    }

    if !grid.cad_data.is_empty() {
        begin(&mut sink, KEYWORD_CAD_DATA, 4 + grid.cad_data.len() as i32)?;
        sink.write_i32(grid.cad_data.len() as i32)?;
        sink.sink.write_all(&grid.cad_data)?;
    }

    sink.finish()
}

/// Write the carried metric as a keyword-62 type-3 solution, transposing
/// the off-diagonals back to file order.
pub fn write_metric(grid: &Grid, path: &Path) -> Result<()> {
    let comm = &grid.comm;
    let mut dest = Vec::new();
    let mut globals = Vec::new();
    let mut values = Vec::new();
    for node in grid.nodes.iter_valid() {
        if !grid.nodes.owned(node) {
            continue;
        }
        let m = grid.nodes.metric_get(node)?;
        dest.push(0);
        globals.push(grid.nodes.global(node));
        values.extend_from_slice(&[m[0], m[1], m[3], m[2], m[4], m[5]]);
    }
    let got_globals = comm.blindsend_ints(&dest, &globals, 1);
    let got_values = comm.blindsend_dbls(&dest, &values, 6);
    if !comm.once() {
        return Ok(());
    }
    let mut order: Vec<usize> = (0..got_globals.len()).collect();
    order.sort_by_key(|&slot| got_globals[slot]);

    let mut sink = ByteSink::create(path, false)?;
    sink.write_i32(KEYWORD_DIMENSION)?;
    sink.write_i32(12)?;
    sink.write_i32(3)?;
    sink.write_i32(KEYWORD_SOLUTION)?;
    sink.write_i32(12 + 8 + 12 + order.len() as i32 * 6 * 8)?;
    sink.write_i32(order.len() as i32)?;
    sink.write_i32(1)?;
    sink.write_i32(SOLUTION_SYM_MAT)?;
    for &slot in &order {
        for i in 0..6 {
            sink.write_f64(got_values[6 * slot + i])?;
        }
    }
    sink.finish()
}

/// Dispatch a mesh read by file extension; `.b8.ugrid` selects the
/// byte-swapped big-endian marker.
pub fn read_by_extension(comm: Arc<Comm>, path: &Path) -> Result<Grid> {
    let name = path.to_string_lossy();
    if name.ends_with(".lb8.ugrid") {
        read_ugrid(comm, path, false)
    } else if name.ends_with(".b8.ugrid") {
        read_ugrid(comm, path, true)
    } else if name.ends_with(".meshb") {
        read_meshb(comm, path)
    } else {
        Err(Error::Invalid(format!(
            "input file name extension unknown: {name}"
        )))
    }
}

/// Dispatch a mesh write by file extension.
pub fn write_by_extension(grid: &Grid, path: &Path) -> Result<()> {
    let name = path.to_string_lossy();
    if name.ends_with(".lb8.ugrid") {
        write_ugrid(grid, path, false)
    } else if name.ends_with(".b8.ugrid") {
        write_ugrid(grid, path, true)
    } else if name.ends_with(".meshb") {
        write_meshb(grid, path)
    } else {
        Err(Error::Invalid(format!(
            "output file name extension unknown: {name}"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::with_fabric;
    use crate::grid::fixtures::{single_tet, six_tet_cube};
    use approx::assert_abs_diff_eq;

    #[test]
    fn implicit_partition_is_balanced() {
        assert_eq!(part_first(10, 3, 0), 0);
        assert_eq!(part_first(10, 3, 1), 4);
        assert_eq!(part_first(10, 3, 2), 8);
        assert_eq!(part_first(10, 3, 3), 10);
        for global in 0..10 {
            let part = part_implicit(10, 3, global);
            assert!(part_first(10, 3, part) <= global);
            assert!(global < part_first(10, 3, part + 1));
        }
    }

    #[test]
    fn ugrid_round_trip_is_byte_identical() {
        let dir = tempfile::tempdir().unwrap();
        let path_a = dir.path().join("mesh.lb8.ugrid");
        let path_b = dir.path().join("again.lb8.ugrid");
        let grid = six_tet_cube();
        write_ugrid(&grid, &path_a, false).unwrap();
        let back = read_ugrid(Arc::new(crate::comm::Comm::solo()), &path_a, false).unwrap();
        assert_eq!(back.nodes.n(), 8);
        assert_eq!(back.tet().n(), 6);
        assert_eq!(back.tri().n(), 12);
        write_ugrid(&back, &path_b, false).unwrap();
        assert_eq!(
            std::fs::read(&path_a).unwrap(),
            std::fs::read(&path_b).unwrap()
        );
    }

    #[test]
    fn big_endian_marker_swaps_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mesh.b8.ugrid");
        let grid = single_tet();
        write_ugrid(&grid, &path, true).unwrap();
        let back = read_ugrid(Arc::new(crate::comm::Comm::solo()), &path, true).unwrap();
        assert_eq!(back.nodes.n(), 4);
        assert_abs_diff_eq!(back.nodes.xyz(1)[0], 1.0);
    }

    #[test]
    fn two_rank_streaming_splits_ownership() {
        // S5: write one tet, read with two ranks; each owns two vertices and
        // both see the cell after the shuffle
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tet.lb8.ugrid");
        write_ugrid(&single_tet(), &path, false).unwrap();
        let results = with_fabric(2, |comm| {
            let grid = read_by_extension(Arc::new(comm), &path).unwrap();
            let owned = grid
                .nodes
                .iter_valid()
                .filter(|&node| grid.nodes.owned(node))
                .count();
            (owned, grid.tet().n(), grid.nodes.n())
        });
        for &(owned, ntet, nnode) in &results {
            assert_eq!(owned, 2);
            assert_eq!(ntet, 1);
            assert_eq!(nnode, 4);
        }
    }

    #[test]
    fn meshb_round_trip_keeps_geometry() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mesh.meshb");
        let mut grid = single_tet();
        grid.add_cell(CellKind::Edg, &[0, 1], 3).unwrap();
        grid.geom.add(0, GeomKind::Node, 1, &[]).unwrap();
        grid.geom.add(0, GeomKind::Edge, 3, &[0.25]).unwrap();
        grid.geom.add(1, GeomKind::Face, 2, &[0.5, 0.75]).unwrap();
        grid.cad_data = vec![1, 2, 3, 4, 5];
        write_meshb(&grid, &path).unwrap();
        let back = read_meshb(Arc::new(crate::comm::Comm::solo()), &path).unwrap();
        assert_eq!(back.nodes.n(), 4);
        assert_eq!(back.tet().n(), 1);
        assert_eq!(back.tri().n(), 4);
        assert_eq!(back.edg().n(), 1);
        assert_eq!(back.cad_data, vec![1, 2, 3, 4, 5]);
        let edge = back.geom.find(0, GeomKind::Edge, 3).unwrap();
        assert_abs_diff_eq!(edge.param[0], 0.25);
        let face = back.geom.find(1, GeomKind::Face, 2).unwrap();
        assert_abs_diff_eq!(face.param[1], 0.75);
        assert!(back.geom.find(0, GeomKind::Node, 1).is_some());
    }

    #[test]
    fn metric_solb_round_trip_transposes_exactly() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metric.solb");
        let mut grid = single_tet();
        let m = [10.0, 1.0, 2.0, 20.0, 3.0, 30.0];
        for node in 0..4 {
            grid.nodes.metric_set(node, &m).unwrap();
        }
        write_metric(&grid, &path).unwrap();

        // the file itself carries (m11, m12, m22, m13, m23, m33)
        let bytes = std::fs::read(&path).unwrap();
        let payload = &bytes[bytes.len() - 4 * 6 * 8..];
        let first = f64::from_le_bytes(payload[0..8].try_into().unwrap());
        let third = f64::from_le_bytes(payload[16..24].try_into().unwrap());
        assert_abs_diff_eq!(first, 10.0, epsilon = 1e-11);
        assert_abs_diff_eq!(third, 20.0, epsilon = 1e-11);

        let mut back = single_tet();
        read_metric(&mut back, &path).unwrap();
        for node in 0..4 {
            let got = back.nodes.metric_get(node).unwrap();
            for i in 0..6 {
                assert_abs_diff_eq!(got[i], m[i], epsilon = 1e-9);
            }
        }
    }

    #[test]
    fn scalar_solb_reads_by_global_id() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("field.solb");
        // hand-write a four-vertex scalar file
        let mut sink = ByteSink::create(&path, false).unwrap();
        sink.write_i32(KEYWORD_DIMENSION).unwrap();
        sink.write_i32(12).unwrap();
        sink.write_i32(3).unwrap();
        sink.write_i32(KEYWORD_SOLUTION).unwrap();
        sink.write_i32(12 + 8 + 12 + 4 * 8).unwrap();
        sink.write_i32(4).unwrap();
        sink.write_i32(1).unwrap();
        sink.write_i32(SOLUTION_SCALAR).unwrap();
        for value in [5.0, 6.0, 7.0, 8.0] {
            sink.write_f64(value).unwrap();
        }
        sink.finish().unwrap();

        let grid = single_tet();
        let scalar = read_scalar(&grid, &path).unwrap();
        for node in 0..4 {
            assert_abs_diff_eq!(scalar[node], 5.0 + node as f64);
        }
    }

    #[test]
    fn unknown_extension_is_invalid() {
        let solo = Arc::new(crate::comm::Comm::solo());
        assert!(read_by_extension(solo, Path::new("mesh.vtk")).is_err());
    }
}
