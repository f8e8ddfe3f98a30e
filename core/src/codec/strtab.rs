//! Substring-tokenized string table.
//!
//! Component and file names in a release repeat the same path fragments
//! endlessly (`lib`, `x86_64`, `release`, extensions). Names are split at
//! separator characters, the fragments interned into a shared table, and
//! each name stored as a short token stream referencing that table.

use crate::error::{Error, Result};
use crate::varint;
use std::collections::HashMap;
use std::io::{Read, Write};

/// Separator following a fragment. `None` terminates a name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Separator {
    None,
    Slash,
    Backslash,
    Dot,
    Dash,
    Underscore,
}

impl Separator {
    pub fn code(self) -> u8 {
        match self {
            Separator::None => 0,
            Separator::Slash => 1,
            Separator::Backslash => 2,
            Separator::Dot => 3,
            Separator::Dash => 4,
            Separator::Underscore => 5,
        }
    }

    pub fn from_code(code: u8) -> Result<Self> {
        Ok(match code {
            0 => Separator::None,
            1 => Separator::Slash,
            2 => Separator::Backslash,
            3 => Separator::Dot,
            4 => Separator::Dash,
            5 => Separator::Underscore,
            other => return Err(Error::Format(format!("unknown separator code {other}"))),
        })
    }

    pub fn from_char(c: char) -> Option<Self> {
        match c {
            '/' => Some(Separator::Slash),
            '\\' => Some(Separator::Backslash),
            '.' => Some(Separator::Dot),
            '-' => Some(Separator::Dash),
            '_' => Some(Separator::Underscore),
            _ => None,
        }
    }

    pub fn as_char(self) -> Option<char> {
        match self {
            Separator::None => None,
            Separator::Slash => Some('/'),
            Separator::Backslash => Some('\\'),
            Separator::Dot => Some('.'),
            Separator::Dash => Some('-'),
            Separator::Underscore => Some('_'),
        }
    }
}

/// One fragment reference plus its trailing separator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Token {
    pub id: u16,
    pub separator: Separator,
}

/// A name as a token stream over some string table.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TokenizedString {
    pub tokens: Vec<Token>,
}

impl TokenizedString {
    /// `varint(token_count)` then `varint(id), u8(separator)` per token.
    pub fn encode<W: Write>(&self, out: &mut W) -> Result<()> {
        varint::write_usize(out, self.tokens.len())?;
        for token in &self.tokens {
            varint::write_u32(out, u32::from(token.id))?;
            out.write_all(&[token.separator.code()])?;
        }
        Ok(())
    }

    pub fn decode<R: Read>(input: &mut R) -> Result<Self> {
        let count = varint::read_usize(input)?;
        let mut tokens = Vec::with_capacity(count.min(1024));
        for _ in 0..count {
            let id = varint::read_u32(input)?;
            let id = u16::try_from(id)
                .map_err(|_| Error::Format(format!("substring id {id} exceeds u16")))?;
            let mut code = [0u8; 1];
            input.read_exact(&mut code).map_err(|_| {
                Error::UnexpectedEof("token stream truncated before separator".into())
            })?;
            tokens.push(Token {
                id,
                separator: Separator::from_code(code[0])?,
            });
        }
        Ok(Self { tokens })
    }

    /// Rebuild the original string against `table`.
    pub fn resolve(&self, table: &[String]) -> Result<String> {
        let mut out = String::new();
        for token in &self.tokens {
            let fragment = table.get(usize::from(token.id)).ok_or_else(|| {
                Error::Format(format!(
                    "substring id {} out of range (table has {})",
                    token.id,
                    table.len()
                ))
            })?;
            out.push_str(fragment);
            if let Some(c) = token.separator.as_char() {
                out.push(c);
            }
        }
        Ok(out)
    }
}

/// Builds the shared substring table while tokenizing names.
///
/// Substring ids are positional: insertion order is the table order, and
/// the table serializes as-is into the release file.
#[derive(Debug, Default)]
pub struct StringTableBuilder {
    ids: HashMap<String, u16>,
    entries: Vec<String>,
}

impl StringTableBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the builder with an existing table (patch application).
    pub fn from_entries(entries: Vec<String>) -> Result<Self> {
        let mut builder = Self::new();
        for entry in entries {
            builder.intern(&entry)?;
        }
        Ok(builder)
    }

    pub fn entries(&self) -> &[String] {
        &self.entries
    }

    pub fn into_entries(self) -> Vec<String> {
        self.entries
    }

    fn intern(&mut self, fragment: &str) -> Result<u16> {
        if let Some(&id) = self.ids.get(fragment) {
            return Ok(id);
        }
        let id = u16::try_from(self.entries.len())
            .map_err(|_| Error::Format("string table exceeds 65536 substrings".into()))?;
        self.ids.insert(fragment.to_string(), id);
        self.entries.push(fragment.to_string());
        Ok(id)
    }

    /// Split `name` at separators, interning each fragment.
    pub fn tokenize(&mut self, name: &str) -> Result<TokenizedString> {
        let mut tokens = Vec::new();
        let mut fragment = String::new();
        for c in name.chars() {
            if let Some(sep) = Separator::from_char(c) {
                tokens.push(Token {
                    id: self.intern(&fragment)?,
                    separator: sep,
                });
                fragment.clear();
            } else {
                fragment.push(c);
            }
        }
        if !fragment.is_empty() {
            tokens.push(Token {
                id: self.intern(&fragment)?,
                separator: Separator::None,
            });
        }
        Ok(TokenizedString { tokens })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(names: &[&str]) {
        let mut builder = StringTableBuilder::new();
        let tokenized: Vec<_> = names
            .iter()
            .map(|n| builder.tokenize(n).unwrap())
            .collect();
        let table = builder.into_entries();
        for (name, tokens) in names.iter().zip(&tokenized) {
            assert_eq!(&tokens.resolve(&table).unwrap(), name);
        }
    }

    #[test]
    fn round_trips_typical_paths() {
        round_trip(&[
            "bin/app",
            "lib/x86_64-linux/libfoo.so.1",
            "docs\\readme.md",
            "release-notes_v2.txt",
            "a/b/c/d",
        ]);
    }

    #[test]
    fn round_trips_edge_shapes() {
        round_trip(&["", "/", "a/", "/a", "...", "__init__.py", "a//b"]);
    }

    #[test]
    fn shared_fragments_are_interned_once() {
        let mut builder = StringTableBuilder::new();
        builder.tokenize("lib/app.so").unwrap();
        builder.tokenize("lib/app.dll").unwrap();
        // lib, app, so, dll plus the empty fragment never appears here.
        assert_eq!(builder.entries(), &["lib", "app", "so", "dll"]);
    }

    #[test]
    fn token_stream_encoding_round_trips() {
        let mut builder = StringTableBuilder::new();
        let tokens = builder.tokenize("pkg/data-file_01.bin").unwrap();
        let mut buf = Vec::new();
        tokens.encode(&mut buf).unwrap();
        let decoded = TokenizedString::decode(&mut std::io::Cursor::new(&buf)).unwrap();
        assert_eq!(decoded, tokens);
    }

    #[test]
    fn unknown_separator_code_is_format_error() {
        let mut buf = Vec::new();
        varint::write_usize(&mut buf, 1).unwrap();
        varint::write_u32(&mut buf, 0).unwrap();
        buf.push(9);
        assert!(matches!(
            TokenizedString::decode(&mut std::io::Cursor::new(&buf)),
            Err(Error::Format(_))
        ));
    }

    #[test]
    fn resolve_rejects_out_of_range_ids() {
        let tokens = TokenizedString {
            tokens: vec![Token {
                id: 3,
                separator: Separator::None,
            }],
        };
        assert!(tokens.resolve(&["only".to_string()]).is_err());
    }
}
