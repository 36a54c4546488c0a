mod client;

pub use client::{Attempt, RawRecord, SocrateaseClient, SocrateaseError, Unit};
