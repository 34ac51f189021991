//! Path transformers: mapping between machine locations and transport paths.
//!
//! A transformer is pure. It never touches the filesystem, so it can run on
//! the hot copy path.

use quarry_core::{ContentHash, MachineLocation};
use std::path::{Path, PathBuf};

/// Directory under a cache root holding content shared with peers.
pub const SHARED_DIR: &str = "shared";

/// File extension of stored content.
pub const BLOB_EXTENSION: &str = "blob";

/// Number of hex characters used for the fan-out directory.
const FANOUT_PREFIX_LEN: usize = 3;

/// Maps machine locations and hashes to transport paths of type `P`.
pub trait PathTransformer<P>: Send + Sync {
    /// Location peers use to reach this machine. Deterministic in `cache_root`.
    fn local_machine_location(&self, cache_root: &P) -> MachineLocation;

    /// Transport path of `hash` on the machine at `location`.
    fn generate_path(&self, hash: &ContentHash, location: &[u8]) -> P;

    /// Location bytes of the machine a path belongs to.
    fn path_location(&self, path: &P) -> Vec<u8>;
}

/// Plain filesystem paths (local disks or mounted peer shares).
///
/// Layout: `<root>/shared/<TAG>/<hex[..3]>/<hex>.blob`.
#[derive(Debug, Clone, Copy, Default)]
pub struct FilesystemPathTransformer;

impl FilesystemPathTransformer {
    /// Path of `hash` below `root`.
    pub fn content_path(root: &Path, hash: &ContentHash) -> PathBuf {
        let hex = hash.to_hex();
        root.join(SHARED_DIR)
            .join(hash.hash_type().tag())
            .join(&hex[..FANOUT_PREFIX_LEN])
            .join(format!("{hex}.{BLOB_EXTENSION}"))
    }
}

impl PathTransformer<PathBuf> for FilesystemPathTransformer {
    fn local_machine_location(&self, cache_root: &PathBuf) -> MachineLocation {
        MachineLocation::new(cache_root.to_string_lossy().into_owned())
    }

    fn generate_path(&self, hash: &ContentHash, location: &[u8]) -> PathBuf {
        let root = PathBuf::from(String::from_utf8_lossy(location).into_owned());
        Self::content_path(&root, hash)
    }

    fn path_location(&self, path: &PathBuf) -> Vec<u8> {
        // <root>/shared/<TAG>/<fanout>/<file>
        path.ancestors()
            .nth(4)
            .unwrap_or(path.as_path())
            .to_string_lossy()
            .into_owned()
            .into_bytes()
    }
}

/// Opaque string handles of the form `<location>/<hash>`.
#[derive(Debug, Clone, Copy, Default)]
pub struct HandlePathTransformer;

impl PathTransformer<String> for HandlePathTransformer {
    fn local_machine_location(&self, cache_root: &String) -> MachineLocation {
        MachineLocation::new(cache_root.trim_end_matches('/'))
    }

    fn generate_path(&self, hash: &ContentHash, location: &[u8]) -> String {
        format!("{}/{hash}", String::from_utf8_lossy(location))
    }

    fn path_location(&self, path: &String) -> Vec<u8> {
        match path.rsplit_once('/') {
            Some((location, _)) => location.as_bytes().to_vec(),
            None => path.as_bytes().to_vec(),
        }
    }
}
