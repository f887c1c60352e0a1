//! Archive a website into a self-describing response store and materialize
//! the archive as a static file tree with rewritten links.
//!
//! The crawl pipeline is three interlocking pieces: the [`scraper`] worker
//! pool fetches and stores responses, the [`rewrite`] tokenizers surface
//! every URL a stored document references, and the [`queue`] decides which
//! of those URLs still need fetching and when the whole crawl is finished.
//! The [`store`] keeps each response as a sealed, integrity-checked file
//! addressed by the canonical key from [`urlkey`].

pub mod cli;
pub mod diff;
pub mod files;
pub mod logging;
pub mod queue;
pub mod rebase;
pub mod rewrite;
pub mod scraper;
pub mod store;
pub mod urlkey;

pub use queue::{Queue, Task};
pub use rebase::{rebase, RebaseError};
pub use rewrite::{media_kind, MediaKind, RewriteAction, RewriteError, UrlKind, UrlRef};
pub use scraper::{FetchError, Scraper, ScraperConfig};
pub use store::{Document, DocumentMetadata, Store, StoreError};
