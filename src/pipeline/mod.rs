//! Pipeline stages for corpus localization.
//!
//! Each submodule implements one stage. The only state passed between
//! stages is the [`crate::registry::Registry`].
//!
//! ## Data Flow
//!
//! ```text
//! raw corpus ──▶ extract ──▶ fetch ──▶ rewrite ──▶ verify
//!                (usages)   (images/)  (localized)  (report)
//!                    ╲          │          ╱          ╱
//!                     ╰──── registry.json ╯──────────╯
//! ```
//!
//! 1. [`extract`]: find remote `<img>` embeddings, canonicalize, register
//!    usage sites
//! 2. [`fetch`]: download pending entries; the only stage with network I/O
//! 3. [`rewrite`]: point every downloaded embedding at its local copy
//! 4. [`verify`]: re-derive the mapping from the raw corpus and diff it
//!    against the localized one

pub mod extract;
pub mod fetch;
pub mod rewrite;
pub mod verify;
