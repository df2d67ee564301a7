pub mod vv;

pub use vv::{decode, encode, VvDescriptor};
