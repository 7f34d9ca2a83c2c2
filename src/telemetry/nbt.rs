//! Tag-tree access for gzip-compressed NBT files, decoded by `fastnbt`.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use flate2::read::GzDecoder;
use thiserror::Error;

pub use fastnbt::Value as Tag;

const MAX_NESTING_DEPTH: usize = 256;

#[derive(Debug, Error)]
pub enum NbtError {
    #[error("failed to read '{path}': {message}")]
    Io { path: String, message: String },
    #[error("malformed NBT: {0}")]
    Decode(String),
    #[error("root tag is not a compound")]
    RootNotCompound,
}

/// Lookups over a decoded tree that never fail; missing or mistyped values
/// read as absent.
pub trait TagExt {
    fn field(&self, key: &str) -> Option<&Tag>;
    fn is_compound(&self) -> bool;
    fn items(&self) -> Option<&[Tag]>;
    fn text(&self) -> Option<&str>;
    /// Integer view of any numeric tag; floating values truncate toward zero.
    fn integer(&self) -> Option<i64>;

    fn int_field(&self, key: &str) -> i64 {
        self.field(key).and_then(TagExt::integer).unwrap_or(0)
    }

    fn flag_field(&self, key: &str) -> bool {
        self.int_field(key) != 0
    }

    /// Depth-first search for the first compound holding `key` whose value
    /// satisfies `accept`. A compound's own key is checked before its
    /// children, which are visited in key order.
    fn find_section<F>(&self, key: &str, accept: F) -> Option<(String, &Tag)>
    where
        F: Fn(&Tag) -> bool;
}

impl TagExt for Tag {
    fn field(&self, key: &str) -> Option<&Tag> {
        match self {
            Tag::Compound(entries) => entries.get(key),
            _ => None,
        }
    }

    fn is_compound(&self) -> bool {
        matches!(self, Tag::Compound(_))
    }

    fn items(&self) -> Option<&[Tag]> {
        match self {
            Tag::List(items) => Some(items),
            _ => None,
        }
    }

    fn text(&self) -> Option<&str> {
        match self {
            Tag::String(value) => Some(value),
            _ => None,
        }
    }

    fn integer(&self) -> Option<i64> {
        match self {
            Tag::Byte(value) => Some(i64::from(*value)),
            Tag::Short(value) => Some(i64::from(*value)),
            Tag::Int(value) => Some(i64::from(*value)),
            Tag::Long(value) => Some(*value),
            Tag::Float(value) => Some(*value as i64),
            Tag::Double(value) => Some(*value as i64),
            Tag::String(value) => value.trim().parse().ok(),
            _ => None,
        }
    }

    fn find_section<F>(&self, key: &str, accept: F) -> Option<(String, &Tag)>
    where
        F: Fn(&Tag) -> bool,
    {
        find_section_at(self, key, &accept, String::new(), 0)
    }
}

fn find_section_at<'a, F>(
    tag: &'a Tag,
    key: &str,
    accept: &F,
    path: String,
    depth: usize,
) -> Option<(String, &'a Tag)>
where
    F: Fn(&Tag) -> bool,
{
    if depth > MAX_NESTING_DEPTH {
        return None;
    }

    match tag {
        Tag::Compound(entries) => {
            if let Some(candidate) = entries.get(key) {
                if accept(candidate) {
                    return Some((join_path(&path, key), candidate));
                }
            }
            let mut names: Vec<&String> = entries.keys().collect();
            names.sort();
            names.into_iter().find_map(|name| {
                let child = entries.get(name.as_str())?;
                find_section_at(child, key, accept, join_path(&path, name), depth + 1)
            })
        }
        Tag::List(items) => items.iter().enumerate().find_map(|(index, child)| {
            find_section_at(child, key, accept, format!("{path}[{index}]"), depth + 1)
        }),
        _ => None,
    }
}

fn join_path(parent: &str, key: &str) -> String {
    if parent.is_empty() {
        key.to_string()
    } else {
        format!("{parent}.{key}")
    }
}

pub fn read_gzip_file(path: &Path) -> Result<Tag, NbtError> {
    let io_error = |error: std::io::Error| NbtError::Io {
        path: path.display().to_string(),
        message: error.to_string(),
    };
    let file = File::open(path).map_err(io_error)?;
    let mut bytes = Vec::new();
    GzDecoder::new(file)
        .read_to_end(&mut bytes)
        .map_err(io_error)?;
    parse_root(&bytes)
}

/// Parses uncompressed NBT whose root must be a compound.
pub fn parse_root(bytes: &[u8]) -> Result<Tag, NbtError> {
    let root: Tag =
        fastnbt::from_bytes(bytes).map_err(|error| NbtError::Decode(error.to_string()))?;
    if root.is_compound() {
        Ok(root)
    } else {
        Err(NbtError::RootNotCompound)
    }
}

/// Test-only encoder used to build snapshot and region fixtures.
#[cfg(test)]
pub(crate) mod writer {
    use std::io::Write;

    use flate2::write::{GzEncoder, ZlibEncoder};
    use flate2::Compression;

    use super::Tag;

    pub(crate) fn compound(entries: Vec<(&str, Tag)>) -> Tag {
        Tag::Compound(
            entries
                .into_iter()
                .map(|(name, value)| (name.to_string(), value))
                .collect(),
        )
    }

    pub(crate) fn encode_root(root: &Tag) -> Vec<u8> {
        fastnbt::to_bytes(root).expect("Expected NBT to encode")
    }

    pub(crate) fn gzip(bytes: &[u8]) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(bytes).expect("Expected gzip write to succeed");
        encoder.finish().expect("Expected gzip finish to succeed")
    }

    pub(crate) fn zlib(bytes: &[u8]) -> Vec<u8> {
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(bytes).expect("Expected zlib write to succeed");
        encoder.finish().expect("Expected zlib finish to succeed")
    }
}

#[cfg(test)]
mod tests {
    use fastnbt::LongArray;

    use super::writer::{compound, encode_root, gzip};
    use super::{parse_root, read_gzip_file, NbtError, Tag, TagExt};

    #[test]
    fn parses_nested_compound_with_lists_and_arrays() {
        let root = compound(vec![(
            "data",
            compound(vec![
                ("name", Tag::String("zdash".to_string())),
                ("ticks", Tag::Long(1234)),
                ("scale", Tag::Double(2.75)),
                (
                    "points",
                    Tag::List(vec![
                        compound(vec![("x", Tag::Int(-5))]),
                        compound(vec![("x", Tag::Int(7))]),
                    ]),
                ),
                ("packed", Tag::LongArray(LongArray::new(vec![i64::MIN, 3]))),
                ("count", Tag::String(" 12 ".to_string())),
            ]),
        )]);

        let decoded = parse_root(&encode_root(&root)).expect("Expected NBT to decode");

        assert_eq!(decoded, root);
        let data = decoded.field("data").expect("Expected data compound");
        assert_eq!(data.int_field("ticks"), 1234);
        assert_eq!(data.int_field("scale"), 2);
        assert_eq!(data.int_field("count"), 12);
        assert_eq!(data.field("name").and_then(TagExt::text), Some("zdash"));
        assert_eq!(data.field("points").and_then(TagExt::items).map(<[Tag]>::len), Some(2));
        assert_eq!(data.int_field("missing"), 0);
    }

    #[test]
    fn finds_first_matching_section_depth_first() {
        let root = compound(vec![
            ("b", Tag::List(vec![compound(vec![(
                "tracker",
                compound(vec![("run", compound(Vec::new()))]),
            )])])),
            ("a", compound(vec![("tracker", Tag::Int(1))])),
            ("c", compound(vec![("tracker", compound(Vec::new()))])),
        ]);

        let (path, tracker) = root
            .find_section("tracker", |tag| tag.is_compound())
            .expect("Expected tracker section");

        assert_eq!(path, "b[0].tracker");
        assert!(tracker.field("run").is_some());
        assert!(root.find_section("samples", |_| true).is_none());
    }

    #[test]
    fn rejects_truncated_input() {
        let bytes = encode_root(&compound(vec![("value", Tag::Int(9))]));

        assert!(matches!(
            parse_root(&bytes[..bytes.len() - 3]),
            Err(NbtError::Decode(_))
        ));
    }

    #[test]
    fn reads_gzip_compressed_file() {
        let directory = tempfile::tempdir().expect("Expected temp dir");
        let path = directory.path().join("command_storage_zdash.dat");
        let root = compound(vec![("value", Tag::Short(42))]);
        std::fs::write(&path, gzip(&encode_root(&root))).expect("Expected fixture write");

        let decoded = read_gzip_file(&path).expect("Expected gzip NBT to decode");
        assert_eq!(decoded.int_field("value"), 42);

        assert!(matches!(
            read_gzip_file(&directory.path().join("missing.dat")),
            Err(NbtError::Io { .. })
        ));
    }
}
