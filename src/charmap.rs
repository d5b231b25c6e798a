//! Character maps: the reduced alphabet of an indexed dataset.
//!
//! A map is the text of `<dataset>.map`; a character's code is the index of
//! its first occurrence in that text.

use std::io;
use std::path::{Path, PathBuf};

use crate::error::{ResourceError, SessionError};

/// Extension of character-map files.
pub const MAP_EXTENSION: &str = "map";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharacterMap {
    alphabet: String,
}

impl CharacterMap {
    pub fn new(alphabet: impl Into<String>) -> Self {
        Self {
            alphabet: alphabet.into(),
        }
    }

    /// `<dir>/<remote_filename>.map`
    pub fn path_for(dir: &Path, remote_filename: &str) -> PathBuf {
        dir.join(format!("{remote_filename}.{MAP_EXTENSION}"))
    }

    pub async fn load(path: &Path) -> Result<Self, ResourceError> {
        match tokio::fs::read_to_string(path).await {
            Ok(alphabet) => Ok(Self::new(alphabet)),
            Err(source) if source.kind() == io::ErrorKind::NotFound => {
                Err(ResourceError::MissingCharacterMap {
                    path: path.to_path_buf(),
                    source,
                })
            }
            Err(source) => Err(ResourceError::Unreadable {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.alphabet
    }

    /// Signed single-byte code of `ch`, if mapped.
    pub fn code(&self, ch: char) -> Option<i8> {
        self.alphabet
            .chars()
            .position(|c| c == ch)
            .and_then(|index| i8::try_from(index).ok())
    }

    /// One code byte per pattern character.
    pub fn encode(&self, pattern: &str) -> Result<Vec<u8>, SessionError> {
        pattern
            .chars()
            .enumerate()
            .map(|(position, ch)| {
                self.code(ch)
                    .map(|code| code as u8)
                    .ok_or(SessionError::UnmappedCharacter { ch, position })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_first_occurrence_indices() {
        let map = CharacterMap::new("$ACGT");
        assert_eq!(map.code('$'), Some(0));
        assert_eq!(map.code('G'), Some(3));
        assert_eq!(map.encode("GATTACA").unwrap(), vec![3, 1, 4, 4, 1, 2, 1]);
    }

    #[test]
    fn unmapped_character_is_an_error() {
        let map = CharacterMap::new("ACGT");
        assert!(matches!(
            map.encode("ACNT"),
            Err(SessionError::UnmappedCharacter { ch: 'N', position: 2 })
        ));
    }

    #[test]
    fn codes_beyond_signed_byte_are_unmapped() {
        let alphabet: String = (0..200u32)
            .filter_map(|i| char::from_u32(0x100 + i))
            .collect();
        let map = CharacterMap::new(alphabet);
        assert_eq!(map.code('\u{100}'), Some(0));
        assert_eq!(map.code(char::from_u32(0x100 + 127).unwrap()), Some(127));
        assert_eq!(map.code(char::from_u32(0x100 + 128).unwrap()), None);
    }

    #[test]
    fn path_uses_map_extension() {
        assert_eq!(
            CharacterMap::path_for(Path::new("/data"), "ecoli"),
            PathBuf::from("/data/ecoli.map")
        );
    }

    #[tokio::test]
    async fn load_reads_file_and_reports_missing() {
        let dir = tempfile::tempdir().unwrap();
        let path = CharacterMap::path_for(dir.path(), "dna");
        std::fs::write(&path, "ACGT").unwrap();

        let map = CharacterMap::load(&path).await.unwrap();
        assert_eq!(map.as_str(), "ACGT");

        let missing = CharacterMap::path_for(dir.path(), "absent");
        assert!(matches!(
            CharacterMap::load(&missing).await,
            Err(ResourceError::MissingCharacterMap { .. })
        ));
    }
}
