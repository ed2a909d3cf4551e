//! `cairn-discovery` – semantic tool discovery.
//!
//! Lets an agent find the capabilities that can serve a request without a
//! hard-coded list of tools.  A request flows through three stages:
//!
//! - [`enricher`] – [`QueryEnricher`] expands the raw text with synonyms,
//!   related terms and parameter hints, one [`Query`] per actionable clause.
//! - [`index`] – [`RetrievalIndex`] ranks the catalog with normalised BM25
//!   against a fixed-generation [`CatalogSnapshot`].
//! - [`cache`] – [`ResultCache`] memoises rankings per session until the
//!   catalog generation changes.
//!
//! [`text`] holds the tokenizer both sides of a match share.

pub mod cache;
pub mod enricher;
pub mod index;
pub mod text;

pub use cache::{CacheConfig, CacheStats, ResultCache};
pub use enricher::{Query, QueryEnricher, SessionContext};
pub use index::{
    Bm25Params, CatalogSnapshot, DEFAULT_THRESHOLD, RankedResults, RetrievalIndex,
    RetrievalResult, merge_results,
};
