//! Git handling: smart-HTTP wire sessions and senddata injectors.
//!
//! Everything here shells out to `git` against the repository path the
//! capability (or the injector params) names; the proxy never links a git
//! library. Subprocesses are spawned with a scrubbed environment and are
//! killed when their consumer goes away.

pub mod archive;
pub mod blob;
pub mod command;
pub mod diff;
pub mod format_patch;
pub mod http;
pub mod show;
pub mod snapshot;

pub use archive::SendArchive;
pub use blob::SendBlob;
pub use diff::SendDiff;
pub use format_patch::SendPatch;
pub use http::{get_info_refs, receive_pack, upload_pack};
pub use show::SendCommit;
pub use snapshot::SendSnapshot;
