use std::collections::HashMap;
use std::fs::File;
use std::path::Path;

use fastanvil::{Chunk, JavaChunk, Region};

use super::classify::Node;

const REGION_CHUNKS: i32 = 32;

/// Looks up the highest bedrock block around a column of a world's End dimension.
pub trait TerrainProbe {
    fn ceiling_near(&self, world_dir: &Path, x: i32, z: i32, radius: i32) -> Option<i32>;
}

pub fn ceilings_by_node(
    probe: &dyn TerrainProbe,
    world_dir: &Path,
    radius: i32,
) -> Vec<(Node, Option<i32>)> {
    Node::ALL
        .iter()
        .map(|node| {
            let (x, z) = node.terrain_anchor();
            (*node, probe.ceiling_near(world_dir, x, z, radius))
        })
        .collect()
}

/// Reads `DIM1/region/r.X.Z.mca` files through `fastanvil`, which knows the
/// numeric-id, spanning and non-spanning block-state layouts of every
/// chunk version.
#[derive(Debug, Clone, Copy, Default)]
pub struct AnvilTerrain;

impl TerrainProbe for AnvilTerrain {
    fn ceiling_near(&self, world_dir: &Path, x: i32, z: i32, radius: i32) -> Option<i32> {
        let region_dir = world_dir.join("DIM1").join("region");
        if !region_dir.is_dir() {
            return None;
        }

        let mut regions: HashMap<(i32, i32), Option<Region<File>>> = HashMap::new();
        let mut chunks: HashMap<(i32, i32), Option<JavaChunk>> = HashMap::new();
        let mut best: Option<i32> = None;
        for block_x in (x - radius)..=(x + radius) {
            for block_z in (z - radius)..=(z + radius) {
                let chunk_key = (block_x.div_euclid(16), block_z.div_euclid(16));
                let chunk = chunks
                    .entry(chunk_key)
                    .or_insert_with(|| load_chunk(&region_dir, &mut regions, chunk_key));
                let Some(chunk) = chunk.as_ref() else {
                    continue;
                };
                let local = ((block_x & 15) as usize, (block_z & 15) as usize);
                if let Some(y) = highest_bedrock(chunk, local.0, local.1) {
                    best = Some(best.map_or(y, |current| current.max(y)));
                }
            }
        }

        best
    }
}

fn open_region(region_dir: &Path, region_x: i32, region_z: i32) -> Option<Region<File>> {
    let region_path = region_dir.join(format!("r.{region_x}.{region_z}.mca"));
    let file = match File::open(&region_path) {
        Ok(file) => file,
        Err(error) => {
            tracing::debug!(path = %region_path.display(), error = %error, "Region file unavailable");
            return None;
        }
    };

    match Region::from_stream(file) {
        Ok(region) => Some(region),
        Err(error) => {
            tracing::debug!(path = %region_path.display(), error = %error, "Failed to open region file");
            None
        }
    }
}

fn load_chunk(
    region_dir: &Path,
    regions: &mut HashMap<(i32, i32), Option<Region<File>>>,
    (chunk_x, chunk_z): (i32, i32),
) -> Option<JavaChunk> {
    let region_key = (
        chunk_x.div_euclid(REGION_CHUNKS),
        chunk_z.div_euclid(REGION_CHUNKS),
    );
    let region = regions
        .entry(region_key)
        .or_insert_with(|| open_region(region_dir, region_key.0, region_key.1))
        .as_mut()?;

    let local_x = chunk_x.rem_euclid(REGION_CHUNKS) as usize;
    let local_z = chunk_z.rem_euclid(REGION_CHUNKS) as usize;
    let data = match region.read_chunk(local_x, local_z) {
        Ok(Some(data)) => data,
        Ok(None) => return None,
        Err(error) => {
            tracing::debug!(chunk_x, chunk_z, error = %error, "Failed to read region chunk");
            return None;
        }
    };

    match JavaChunk::from_bytes(&data) {
        Ok(chunk) => Some(chunk),
        Err(error) => {
            tracing::debug!(chunk_x, chunk_z, error = %error, "Failed to decode region chunk");
            None
        }
    }
}

/// Top-down scan over the chunk's whole build height.
fn highest_bedrock(chunk: &impl Chunk, local_x: usize, local_z: usize) -> Option<i32> {
    chunk
        .y_range()
        .rev()
        .find(|y| {
            chunk
                .block(local_x, *y, local_z)
                .is_some_and(|block| block.name().contains("bedrock"))
        })
        .and_then(|y| i32::try_from(y).ok())
}

#[cfg(test)]
pub(crate) mod fixtures {
    use std::path::Path;

    use fastnbt::LongArray;

    use super::super::nbt::writer::{compound, encode_root, zlib};
    use super::super::nbt::Tag;

    fn block(name: &str) -> Tag {
        compound(vec![("Name", Tag::String(name.to_string()))])
    }

    /// Writes a single-chunk 1.20 region containing one bedrock block at `(x, y, z)`.
    pub(crate) fn write_bedrock_region(world_dir: &Path, x: i32, y: i32, z: i32) {
        let (chunk_x, chunk_z) = (x.div_euclid(16), z.div_euclid(16));
        let block_index = ((y & 15) * 256 + (z & 15) * 16 + (x & 15)) as usize;
        let mut data = vec![0i64; 256];
        data[block_index / 16] = 1i64 << ((block_index % 16) * 4);

        let heightmap = || Tag::LongArray(LongArray::new(vec![0; 37]));
        let chunk = compound(vec![
            ("DataVersion", Tag::Int(3465)),
            ("Status", Tag::String("minecraft:full".to_string())),
            ("xPos", Tag::Int(chunk_x)),
            ("zPos", Tag::Int(chunk_z)),
            ("yPos", Tag::Int(y >> 4)),
            (
                "Heightmaps",
                compound(vec![
                    ("MOTION_BLOCKING", heightmap()),
                    ("MOTION_BLOCKING_NO_LEAVES", heightmap()),
                    ("OCEAN_FLOOR", heightmap()),
                    ("WORLD_SURFACE", heightmap()),
                ]),
            ),
            (
                "sections",
                Tag::List(vec![compound(vec![
                    ("Y", Tag::Byte((y >> 4) as i8)),
                    (
                        "block_states",
                        compound(vec![
                            (
                                "palette",
                                Tag::List(vec![block("minecraft:air"), block("minecraft:bedrock")]),
                            ),
                            ("data", Tag::LongArray(LongArray::new(data))),
                        ]),
                    ),
                    (
                        "biomes",
                        compound(vec![(
                            "palette",
                            Tag::List(vec![Tag::String("minecraft:the_end".to_string())]),
                        )]),
                    ),
                ])]),
            ),
        ]);
        let compressed = zlib(&encode_root(&chunk));

        let mut region = vec![0u8; 8192];
        let slot = (chunk_x.rem_euclid(32) + chunk_z.rem_euclid(32) * 32) as usize * 4;
        let sectors = (compressed.len() + 5).div_ceil(4096) as u8;
        region[slot..slot + 4].copy_from_slice(&[0, 0, 2, sectors]);
        region.extend_from_slice(&((compressed.len() + 1) as u32).to_be_bytes());
        region.push(2);
        region.extend_from_slice(&compressed);
        region.resize(8192 + sectors as usize * 4096, 0);

        let region_dir = world_dir.join("DIM1").join("region");
        std::fs::create_dir_all(&region_dir).expect("Expected region dir");
        std::fs::write(
            region_dir.join(format!(
                "r.{}.{}.mca",
                chunk_x.div_euclid(32),
                chunk_z.div_euclid(32)
            )),
            region,
        )
        .expect("Expected region write");
    }
}
