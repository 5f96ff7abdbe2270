//! Built-in stage workers
//!
//! Sources that create batches, the augmentation stage that transforms
//! them and a tap that dumps them. Transport and persistence stages live
//! in [`crate::network`] and [`crate::store`].

pub mod augment;
pub mod generator;
pub mod reader;
pub mod tap;

pub use augment::Augmenter;
pub use generator::{Fill, Generator, GeneratorConfig};
pub use reader::{Loader, ReadOrder, ReaderConfig, SampleReader};
pub use tap::{Dump, Tap};
