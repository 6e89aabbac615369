#[cfg(feature = "native")]
pub mod native;
