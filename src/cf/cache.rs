// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! A directory of CFs on disk, so they need not be recomputed across runs.
//!
//! Each cell is a little-endian binary file:
//!
//! - 4 bytes, ASCII "HGCF"
//! - u32 format version
//! - u8 class tag (0 homogeneous, 1 heterogeneous), then two u16 antenna
//!   types
//! - f64 PA \[radians\], f64 w \[wavelengths\], f64 frequency \[Hz\]
//! - u32 pol, u32 sampling, u32 support, u32 ny, u32 nx
//! - `ny * nx` pairs of f32 (re, im), row major

use std::{
    fs::File,
    io::{BufReader, BufWriter, ErrorKind, Read, Write},
    path::{Path, PathBuf},
};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use glob::glob;
use log::{debug, warn};
use marlu::c32;
use ndarray::prelude::*;

use super::{AntennaType, BaselineClass, CFCell, CellKey, CfCacheError};
use crate::constants::CF_CACHE_VERSION;

const MAGIC: &[u8; 4] = b"HGCF";

/// CFs bigger than this along an axis are assumed to be garbage.
const MAX_CF_DIM: usize = 1 << 14;

#[derive(Debug, Clone)]
pub struct CfCache {
    dir: PathBuf,
}

impl CfCache {
    /// Use `dir` as a CF cache, creating it if necessary.
    pub fn new<P: AsRef<Path>>(dir: P) -> Result<CfCache, CfCacheError> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        Ok(CfCache { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// The file that holds (or would hold) the cell for `key`. Floats are
    /// written as their bits so that names are exact.
    pub fn file_for(&self, key: &CellKey) -> PathBuf {
        self.dir.join(format!(
            "CFS_{}_{:016x}_{:016x}_{:016x}_{}.cf",
            key.class,
            key.pa.to_bits(),
            key.w.to_bits(),
            key.freq.to_bits(),
            key.pol
        ))
    }

    pub fn save(&self, cell: &CFCell) -> Result<PathBuf, CfCacheError> {
        let file = self.file_for(&cell.key);
        write_cell(cell, &file)?;
        Ok(file)
    }

    /// Read the cell for `key`, if it's been cached.
    pub fn load(&self, key: &CellKey) -> Result<Option<CFCell>, CfCacheError> {
        let file = self.file_for(key);
        if !file.exists() {
            return Ok(None);
        }
        let cell = read_cell(&file)?;
        if cell.key != *key {
            return Err(CfCacheError::Malformed {
                file,
                msg: format!("contains a CF for {}, not {key}", cell.key),
            });
        }
        Ok(Some(cell))
    }

    /// Read every cell in the cache. Files that can't be read are logged and
    /// skipped.
    pub fn load_all(&self) -> Result<Vec<CFCell>, CfCacheError> {
        let pattern = self.dir.join("CFS_*.cf");
        let mut cells = vec![];
        for entry in glob(&pattern.display().to_string())? {
            let file = entry?;
            match read_cell(&file) {
                Ok(c) => cells.push(c),
                Err(e) => warn!("Ignoring CF cache file: {e}"),
            }
        }
        debug!("Read {} CFs from {}", cells.len(), self.dir.display());
        Ok(cells)
    }
}

fn read_error(e: std::io::Error, file: &Path) -> CfCacheError {
    if e.kind() == ErrorKind::UnexpectedEof {
        CfCacheError::Truncated {
            file: file.to_path_buf(),
        }
    } else {
        CfCacheError::IO(e)
    }
}

fn read_cell(file: &Path) -> Result<CFCell, CfCacheError> {
    let mut f = BufReader::new(File::open(file)?);
    let e = |err| read_error(err, file);
    let malformed = |msg: String| CfCacheError::Malformed {
        file: file.to_path_buf(),
        msg,
    };

    let mut magic = [0; 4];
    f.read_exact(&mut magic).map_err(e)?;
    if &magic != MAGIC {
        return Err(CfCacheError::BadMagic {
            file: file.to_path_buf(),
        });
    }
    let version = f.read_u32::<LittleEndian>().map_err(e)?;
    if version != CF_CACHE_VERSION {
        return Err(CfCacheError::Version {
            file: file.to_path_buf(),
            got: version,
            expected: CF_CACHE_VERSION,
        });
    }

    let tag = f.read_u8().map_err(e)?;
    let a = AntennaType(f.read_u16::<LittleEndian>().map_err(e)?);
    let b = AntennaType(f.read_u16::<LittleEndian>().map_err(e)?);
    let class = match tag {
        0 => BaselineClass::Homogeneous(a),
        1 => BaselineClass::from_antenna_types(a, b),
        t => return Err(malformed(format!("unknown baseline class tag {t}"))),
    };
    let key = CellKey {
        class,
        pa: f.read_f64::<LittleEndian>().map_err(e)?,
        w: f.read_f64::<LittleEndian>().map_err(e)?,
        freq: f.read_f64::<LittleEndian>().map_err(e)?,
        pol: f.read_u32::<LittleEndian>().map_err(e)? as usize,
    };
    let sampling = f.read_u32::<LittleEndian>().map_err(e)?;
    let support = f.read_u32::<LittleEndian>().map_err(e)?;
    let ny = f.read_u32::<LittleEndian>().map_err(e)? as usize;
    let nx = f.read_u32::<LittleEndian>().map_err(e)? as usize;
    if ny > MAX_CF_DIM || nx > MAX_CF_DIM {
        return Err(malformed(format!("unreasonable CF dimensions {ny}x{nx}")));
    }

    let mut pixels = Array2::<c32>::zeros((ny, nx));
    let slice = pixels
        .as_slice_mut()
        .ok_or_else(|| malformed("couldn't lay out CF pixels".into()))?;
    f.read_f32_into::<LittleEndian>(bytemuck::cast_slice_mut(slice))
        .map_err(e)?;

    Ok(CFCell::new(key, pixels, sampling, support)?)
}

fn write_cell(cell: &CFCell, file: &Path) -> Result<(), CfCacheError> {
    let mut f = BufWriter::new(File::create(file)?);
    f.write_all(MAGIC)?;
    f.write_u32::<LittleEndian>(CF_CACHE_VERSION)?;
    let (tag, (a, b)) = match cell.key.class {
        c @ BaselineClass::Homogeneous(_) => (0, c.antenna_types()),
        c @ BaselineClass::Heterogeneous(..) => (1, c.antenna_types()),
    };
    f.write_u8(tag)?;
    f.write_u16::<LittleEndian>(a.0)?;
    f.write_u16::<LittleEndian>(b.0)?;
    f.write_f64::<LittleEndian>(cell.key.pa)?;
    f.write_f64::<LittleEndian>(cell.key.w)?;
    f.write_f64::<LittleEndian>(cell.key.freq)?;
    f.write_u32::<LittleEndian>(cell.key.pol as u32)?;
    f.write_u32::<LittleEndian>(cell.sampling)?;
    f.write_u32::<LittleEndian>(cell.support)?;
    let (ny, nx) = cell.pixels.dim();
    f.write_u32::<LittleEndian>(ny as u32)?;
    f.write_u32::<LittleEndian>(nx as u32)?;
    for p in cell.pixels.iter() {
        f.write_f32::<LittleEndian>(p.re)?;
        f.write_f32::<LittleEndian>(p.im)?;
    }
    f.flush()?;
    Ok(())
}
