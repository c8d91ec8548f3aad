use std::fmt;
use std::path::{Path, PathBuf};

/// First four bytes of every flat-format model.
pub const FLAT_MAGIC: [u8; 4] = *b"LPFB";

/// The three encodings a model passes through during conversion.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Encoding {
    Checkpoint,
    Intermediate,
    Flat,
}

impl Encoding {
    pub fn as_str(&self) -> &'static str {
        match self {
            Encoding::Checkpoint => "checkpoint",
            Encoding::Intermediate => "intermediate",
            Encoding::Flat => "flat",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "checkpoint" => Some(Encoding::Checkpoint),
            "intermediate" => Some(Encoding::Intermediate),
            "flat" => Some(Encoding::Flat),
            _ => None,
        }
    }
}

impl fmt::Display for Encoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug)]
pub enum ModelArtifact {
    CheckpointPath(PathBuf),
    IntermediatePath(PathBuf),
    FlatPath(PathBuf),
}

impl ModelArtifact {
    pub fn path(&self) -> &Path {
        match self {
            ModelArtifact::CheckpointPath(p)
            | ModelArtifact::IntermediatePath(p)
            | ModelArtifact::FlatPath(p) => p,
        }
    }

    pub fn encoding(&self) -> Encoding {
        match self {
            ModelArtifact::CheckpointPath(_) => Encoding::Checkpoint,
            ModelArtifact::IntermediatePath(_) => Encoding::Intermediate,
            ModelArtifact::FlatPath(_) => Encoding::Flat,
        }
    }
}
