//! Pluggable item-id strategies.

use crate::rpc::Fault;
use rand::{rngs::OsRng, Rng, RngCore};
use std::{fs, io, path::Path};

/// Mints candidate ids; the store checks them against the index and retries
/// on collision.
#[derive(Clone, Debug)]
pub enum IdGenerator {
    /// `length` cryptographically random bytes, base58-encoded.
    Random { length: usize },
    /// `count` words drawn uniformly from a wordlist, joined by `-`.
    Wordlist { words: Vec<String>, count: usize },
}

impl IdGenerator {
    pub fn random(length: usize) -> Self {
        IdGenerator::Random { length }
    }

    /// Load a wordlist, one word per line; empty lines are skipped.
    pub fn from_wordlist(path: &Path, count: usize) -> io::Result<Self> {
        let words: Vec<String> = fs::read_to_string(path)?
            .lines()
            .map(str::trim)
            .filter(|word| !word.is_empty())
            .map(str::to_string)
            .collect();

        if words.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("wordlist {} holds no words", path.display()),
            ));
        }

        Ok(IdGenerator::Wordlist { words, count })
    }

    pub fn generate(&self) -> Result<String, Fault> {
        match self {
            IdGenerator::Random { length } => {
                let mut buf = vec![0u8; *length];
                OsRng
                    .try_fill_bytes(&mut buf)
                    .map_err(|err| Fault::io(err))?;

                Ok(bs58::encode(buf).into_string())
            }
            IdGenerator::Wordlist { words, count } => {
                let parts: Vec<&str> = (0..*count)
                    .map(|_| words[OsRng.gen_range(0..words.len())].as_str())
                    .collect();

                Ok(parts.join("-"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn random_ids_are_base58() {
        let generator = IdGenerator::random(4);

        for _ in 0..32 {
            let id = generator.generate().unwrap();
            assert!(!id.is_empty());
            assert!(id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() && c != '0' && c != 'O' && c != 'I' && c != 'l'));
        }
    }

    #[test]
    fn random_ids_differ() {
        let generator = IdGenerator::random(8);
        assert_ne!(generator.generate().unwrap(), generator.generate().unwrap());
    }

    #[test]
    fn wordlist_ids_join_words() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "alpha\nbravo\ncharlie\n\n  \n").unwrap();

        let generator = IdGenerator::from_wordlist(file.path(), 3).unwrap();
        let id = generator.generate().unwrap();

        let parts: Vec<&str> = id.split('-').collect();
        assert_eq!(parts.len(), 3);
        for part in parts {
            assert!(["alpha", "bravo", "charlie"].contains(&part), "{}", part);
        }
    }

    #[test]
    fn empty_wordlist_is_rejected() {
        let file = tempfile::NamedTempFile::new().unwrap();
        assert!(IdGenerator::from_wordlist(file.path(), 2).is_err());
    }
}
