//! ofpx — extraction of Oppo/OnePlus/Realme firmware containers.
//!
//! Three container flavours exist in the wild: `.ofp` (an undocumented
//! format with an encrypted XML manifest near the end of the file), `.ops`
//! (a 512-byte trailer plus a manifest encrypted with a vendor block
//! cipher), and plain ZIP.  None of them carry a version field; which key
//! material decrypts a given container is established empirically — a
//! candidate is accepted when the decrypted manifest header looks like XML.
//!
//! The entry point is [`extract::Extractor`]:
//!
//! ```no_run
//! use ofpx::extract::Extractor;
//!
//! let dir = Extractor::new("firmware.ofp")
//!     .with_log(|line| eprintln!("{line}"))
//!     .extract(None)?;
//! println!("extracted to {}", dir.display());
//! # Ok::<(), ofpx::ExtractError>(())
//! ```

pub mod crypto;
pub mod extract;
pub mod keys;
pub mod manifest;
pub mod sniff;

pub use extract::{ExtractError, Extractor};
pub use manifest::{EntryKind, ManifestEntry};
pub use sniff::ContainerKind;

/// Free-text diagnostic sink supplied by the caller.
///
/// Lines are human-readable progress/diagnostic messages and are never
/// machine-parsed.  The library calls it synchronously from the extraction
/// thread.
pub type LogFn<'a> = dyn Fn(&str) + 'a;
