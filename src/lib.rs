#![doc = include_str!("../README.md")]

pub mod error;

pub use error::Error;
pub use error::Result;

pub mod ngram;

pub mod range;

pub use range::Posting;
pub use range::Span;

pub mod featurizer;

pub use featurizer::Featurizer;
pub use featurizer::Token;

pub mod score;

pub mod record;

pub use record::Record;
pub use record::SearchHit;

pub mod storage;

pub use storage::Backend;
pub use storage::BackendKind;
pub use storage::BackendRegistry;

pub mod builder;

pub use builder::BuildConfig;

pub mod index;

pub use index::Index;
pub use index::SearchOptions;

pub mod parallel;

pub use parallel::ParallelIndex;
