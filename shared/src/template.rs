//! Optional pre-authored map layout with per-block-type breakability.
//!
//! Templates are stored as JSON in the server's maps directory. Block data is
//! kept per 16x16 chunk column and run-length encoded on disk.

use crate::block::BlockType;
use crate::{CHUNK_SIZE, WORLD_HEIGHT};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use thiserror::Error;

/// File extension recognised when scanning a maps directory.
pub const TEMPLATE_EXTENSION: &str = "json";

#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("failed to read template {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse template: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid template: {0}")]
    Invalid(String),
}

/// One chunk column as stored on disk: `[block id, run length]` pairs in
/// x-major, then z, then y order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateChunkFile {
    pub cx: i32,
    pub cz: i32,
    pub runs: Vec<[u32; 2]>,
}

/// On-disk shape of a template.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateFile {
    pub id: String,
    pub version: u32,
    #[serde(default)]
    pub name: String,
    pub chunk_min_x: i32,
    pub chunk_max_x: i32,
    pub chunk_min_z: i32,
    pub chunk_max_z: i32,
    #[serde(default)]
    pub spawn: Option<[f32; 3]>,
    /// Block ids players may break when they come from the template.
    #[serde(default)]
    pub breakable: Vec<u8>,
    #[serde(default)]
    pub chunks: Vec<TemplateChunkFile>,
}

const CHUNK_VOLUME: usize = (CHUNK_SIZE * CHUNK_SIZE) as usize * WORLD_HEIGHT as usize;

fn local_index(lx: i32, y: i32, lz: i32) -> usize {
    ((lx * CHUNK_SIZE + lz) * WORLD_HEIGHT + y) as usize
}

/// A bounded, pre-authored block layout.
#[derive(Debug, Clone)]
pub struct MapTemplate {
    pub id: String,
    pub version: u32,
    pub name: String,
    pub chunk_min_x: i32,
    pub chunk_max_x: i32,
    pub chunk_min_z: i32,
    pub chunk_max_z: i32,
    pub spawn: Option<[f32; 3]>,
    breakable: HashSet<BlockType>,
    chunks: HashMap<(i32, i32), Vec<BlockType>>,
}

impl MapTemplate {
    /// Empty template covering the given inclusive chunk range.
    pub fn new(id: &str, version: u32, chunk_min: (i32, i32), chunk_max: (i32, i32)) -> Self {
        Self {
            id: id.to_string(),
            version,
            name: String::new(),
            chunk_min_x: chunk_min.0,
            chunk_max_x: chunk_max.0,
            chunk_min_z: chunk_min.1,
            chunk_max_z: chunk_max.1,
            spawn: None,
            breakable: HashSet::new(),
            chunks: HashMap::new(),
        }
    }

    /// A template with an empty id or a zero version is not usable.
    pub fn is_valid(&self) -> bool {
        !self.id.is_empty() && self.version != 0
    }

    pub fn set_breakable(&mut self, block: BlockType, breakable: bool) {
        if breakable {
            self.breakable.insert(block);
        } else {
            self.breakable.remove(&block);
        }
    }

    pub fn is_breakable(&self, block: BlockType) -> bool {
        self.breakable.contains(&block)
    }

    pub fn breakable_blocks(&self) -> impl Iterator<Item = BlockType> + '_ {
        self.breakable.iter().copied()
    }

    /// Whether the column (x, z) lies inside the template's chunk range.
    pub fn contains_column(&self, x: i32, z: i32) -> bool {
        let cx = x.div_euclid(CHUNK_SIZE);
        let cz = z.div_euclid(CHUNK_SIZE);
        (self.chunk_min_x..=self.chunk_max_x).contains(&cx)
            && (self.chunk_min_z..=self.chunk_max_z).contains(&cz)
    }

    /// Template block at (x, y, z); air outside bounds or in a missing chunk.
    pub fn get_block(&self, x: i32, y: i32, z: i32) -> BlockType {
        if !(0..WORLD_HEIGHT).contains(&y) || !self.contains_column(x, z) {
            return BlockType::Air;
        }
        let key = (x.div_euclid(CHUNK_SIZE), z.div_euclid(CHUNK_SIZE));
        match self.chunks.get(&key) {
            Some(blocks) => {
                blocks[local_index(x.rem_euclid(CHUNK_SIZE), y, z.rem_euclid(CHUNK_SIZE))]
            }
            None => BlockType::Air,
        }
    }

    /// Authoring helper; writes outside the bounds are ignored.
    pub fn set_block(&mut self, x: i32, y: i32, z: i32, block: BlockType) {
        if !(0..WORLD_HEIGHT).contains(&y) || !self.contains_column(x, z) {
            return;
        }
        let key = (x.div_euclid(CHUNK_SIZE), z.div_euclid(CHUNK_SIZE));
        let blocks = self
            .chunks
            .entry(key)
            .or_insert_with(|| vec![BlockType::Air; CHUNK_VOLUME]);
        blocks[local_index(x.rem_euclid(CHUNK_SIZE), y, z.rem_euclid(CHUNK_SIZE))] = block;
    }

    /// Inclusive world-space block bounds `(min_x, min_z, max_x, max_z)`.
    pub fn block_bounds(&self) -> (i32, i32, i32, i32) {
        (
            self.chunk_min_x * CHUNK_SIZE,
            self.chunk_min_z * CHUNK_SIZE,
            (self.chunk_max_x + 1) * CHUNK_SIZE - 1,
            (self.chunk_max_z + 1) * CHUNK_SIZE - 1,
        )
    }

    pub fn from_file(file: TemplateFile) -> Result<Self, TemplateError> {
        if file.chunk_min_x > file.chunk_max_x || file.chunk_min_z > file.chunk_max_z {
            return Err(TemplateError::Invalid(format!(
                "empty chunk range in template '{}'",
                file.id
            )));
        }

        let mut template = MapTemplate::new(
            &file.id,
            file.version,
            (file.chunk_min_x, file.chunk_min_z),
            (file.chunk_max_x, file.chunk_max_z),
        );
        template.name = file.name;
        template.spawn = file.spawn;
        for id in file.breakable {
            template.breakable.insert(BlockType::from_id(id));
        }

        for chunk in file.chunks {
            let mut blocks = Vec::with_capacity(CHUNK_VOLUME);
            for [id, count] in chunk.runs {
                let block = BlockType::from_id(id.min(u8::MAX as u32) as u8);
                // Cap each run one past the chunk size so oversized data is caught below.
                let room = CHUNK_VOLUME + 1 - blocks.len();
                blocks.extend(std::iter::repeat(block).take((count as usize).min(room)));
                if blocks.len() > CHUNK_VOLUME {
                    break;
                }
            }
            if blocks.len() != CHUNK_VOLUME {
                return Err(TemplateError::Invalid(format!(
                    "chunk ({}, {}) holds {} blocks, expected {}",
                    chunk.cx,
                    chunk.cz,
                    blocks.len(),
                    CHUNK_VOLUME
                )));
            }
            template.chunks.insert((chunk.cx, chunk.cz), blocks);
        }

        Ok(template)
    }

    pub fn to_file(&self) -> TemplateFile {
        let mut keys: Vec<&(i32, i32)> = self.chunks.keys().collect();
        keys.sort();

        let chunks = keys
            .into_iter()
            .map(|&(cx, cz)| {
                let mut runs: Vec<[u32; 2]> = Vec::new();
                for block in &self.chunks[&(cx, cz)] {
                    match runs.last_mut() {
                        Some(run) if run[0] == block.id() as u32 => run[1] += 1,
                        _ => runs.push([block.id() as u32, 1]),
                    }
                }
                TemplateChunkFile { cx, cz, runs }
            })
            .collect();

        let mut breakable: Vec<u8> = self.breakable.iter().map(|b| b.id()).collect();
        breakable.sort_unstable();

        TemplateFile {
            id: self.id.clone(),
            version: self.version,
            name: self.name.clone(),
            chunk_min_x: self.chunk_min_x,
            chunk_max_x: self.chunk_max_x,
            chunk_min_z: self.chunk_min_z,
            chunk_max_z: self.chunk_max_z,
            spawn: self.spawn,
            breakable,
            chunks,
        }
    }

    pub fn load(path: &Path) -> Result<Self, TemplateError> {
        let text = fs::read_to_string(path).map_err(|source| TemplateError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let file: TemplateFile = serde_json::from_str(&text)?;
        Self::from_file(file)
    }

    pub fn save(&self, path: &Path) -> Result<(), TemplateError> {
        let text = serde_json::to_string(&self.to_file())?;
        fs::write(path, text).map_err(|source| TemplateError::Io {
            path: path.to_path_buf(),
            source,
        })
    }
}

/// Picks the most recently modified template file in `dir`.
///
/// Selection is by modification time, never by name. Returns `None` when the
/// directory is missing, holds no template files, or the newest one is
/// unreadable or invalid; callers fall back to procedural terrain.
pub fn load_latest_template(dir: &Path) -> Option<MapTemplate> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            warn!("Cannot read maps directory {}: {}", dir.display(), e);
            return None;
        }
    };

    let newest = entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| {
            path.is_file()
                && path.extension().and_then(|e| e.to_str()) == Some(TEMPLATE_EXTENSION)
        })
        .map(|path| {
            let modified = fs::metadata(&path)
                .and_then(|m| m.modified())
                .unwrap_or(SystemTime::UNIX_EPOCH);
            (modified, path)
        })
        .max_by_key(|(modified, _)| *modified)?;

    match MapTemplate::load(&newest.1) {
        Ok(template) if template.is_valid() => {
            info!(
                "Loaded map template '{}' v{} from {}",
                template.id,
                template.version,
                newest.1.display()
            );
            Some(template)
        }
        Ok(template) => {
            warn!(
                "Ignoring template {} with id '{}' and version {}",
                newest.1.display(),
                template.id,
                template.version
            );
            None
        }
        Err(e) => {
            warn!("Ignoring template {}: {}", newest.1.display(), e);
            None
        }
    }
}
