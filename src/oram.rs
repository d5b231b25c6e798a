//! ORAM configuration sent to the enclave before a dataset is loaded.

use std::fmt;
use std::str::FromStr;

use bytes::{BufMut, BytesMut};

use crate::error::ConfigError;

/// Default number of pointers per recursive position-map block.
pub const DEFAULT_REC_MAP_SIZE: u32 = 4;

/// Default number of suffix-array entries per ORAM block.
pub const DEFAULT_SA_BLOCK_SIZE: u32 = 16;

/// Seven little-endian `u32` fields.
pub const ENCODED_LEN: usize = 7 * 4;

/// Usage line for the `config` arguments.
pub const USAGE: &str = "<oram_type> <Z> <stash> [S A] [rec_map_size] [sa_block_size]";

/// ORAM family. `So*` are the server-oblivious variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OramKind {
    Circuit,
    Ring,
    Path,
    SoCircuit,
    SoRing,
    SoPath,
}

impl OramKind {
    pub const ALL: [OramKind; 6] = [
        Self::Circuit,
        Self::Ring,
        Self::Path,
        Self::SoCircuit,
        Self::SoRing,
        Self::SoPath,
    ];

    /// Wire code.
    pub fn code(self) -> u32 {
        match self {
            Self::Circuit => 0,
            Self::Ring => 1,
            Self::Path => 2,
            Self::SoCircuit => 3,
            Self::SoRing => 4,
            Self::SoPath => 5,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Circuit => "circuit",
            Self::Ring => "ring",
            Self::Path => "path",
            Self::SoCircuit => "so_circuit",
            Self::SoRing => "so_ring",
            Self::SoPath => "so_path",
        }
    }

    /// Ring ORAMs (plain or server-oblivious) take `S` and `A`.
    pub fn is_ring(self) -> bool {
        matches!(self, Self::Ring | Self::SoRing)
    }
}

impl fmt::Display for OramKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for OramKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.name() == s)
            .ok_or_else(|| ConfigError::UnknownOramType(s.to_string()))
    }
}

/// Parameters of the enclave's ORAM. Immutable once sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OramConfig {
    pub kind: OramKind,
    /// Valid records per bucket (`Z`).
    pub bucket_size: u32,
    pub stash_size: u32,
    /// Dummy blocks per bucket (`S`, ring only).
    pub dummy_blocks: u32,
    /// Eviction rate (`A`, ring and path).
    pub eviction_rate: u32,
    pub rec_map_size: u32,
    pub sa_block_size: u32,
}

impl OramConfig {
    pub fn new(kind: OramKind, bucket_size: u32, stash_size: u32) -> Self {
        Self {
            kind,
            bucket_size,
            stash_size,
            dummy_blocks: 0,
            eviction_rate: 0,
            rec_map_size: DEFAULT_REC_MAP_SIZE,
            sa_block_size: DEFAULT_SA_BLOCK_SIZE,
        }
    }

    /// Parse `<oram_type> <Z> <stash> [S A] [rec_map_size] [sa_block_size]`.
    ///
    /// Ring families require `S A`; plain path requires `A`. At most two
    /// trailing optional integers follow.
    pub fn parse_args<S: AsRef<str>>(args: &[S]) -> Result<Self, ConfigError> {
        let args: Vec<&str> = args.iter().map(AsRef::as_ref).collect();
        if args.len() < 3 {
            return Err(ConfigError::MissingArguments("oram_type, Z and stash are required"));
        }

        let kind: OramKind = args[0].parse()?;
        let mut config = Self::new(
            kind,
            parse_u32("Z", args[1])?,
            parse_u32("stash", args[2])?,
        );

        let mut rest = &args[3..];
        if kind.is_ring() {
            if rest.len() < 2 {
                return Err(ConfigError::MissingArguments("ring ORAM requires S and A"));
            }
            config.dummy_blocks = parse_u32("S", rest[0])?;
            config.eviction_rate = parse_u32("A", rest[1])?;
            rest = &rest[2..];
        } else if kind == OramKind::Path {
            let Some(a) = rest.first() else {
                return Err(ConfigError::MissingArguments("path ORAM requires A"));
            };
            config.eviction_rate = parse_u32("A", a)?;
            rest = &rest[1..];
        }

        match rest {
            [] => {}
            [rec] => config.rec_map_size = parse_u32("rec_map_size", rec)?,
            [rec, sa] => {
                config.rec_map_size = parse_u32("rec_map_size", rec)?;
                config.sa_block_size = parse_u32("sa_block_size", sa)?;
            }
            _ => return Err(ConfigError::TooManyArguments),
        }

        Ok(config)
    }

    /// Fixed order: type, Z, stash, S, A, rec_map_size, sa_block_size.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(ENCODED_LEN);
        buf.put_u32_le(self.kind.code());
        buf.put_u32_le(self.bucket_size);
        buf.put_u32_le(self.stash_size);
        buf.put_u32_le(self.dummy_blocks);
        buf.put_u32_le(self.eviction_rate);
        buf.put_u32_le(self.rec_map_size);
        buf.put_u32_le(self.sa_block_size);
        buf.to_vec()
    }

    /// Output label, e.g. `ringZ4`.
    pub fn label(&self) -> String {
        format!("{}Z{}", self.kind.name(), self.bucket_size)
    }
}

impl FromStr for OramConfig {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let args: Vec<&str> = s.split_whitespace().collect();
        Self::parse_args(&args)
    }
}

fn parse_u32(field: &'static str, value: &str) -> Result<u32, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidInteger {
        field,
        value: value.to_string(),
    })
}
