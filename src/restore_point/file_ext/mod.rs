use std::sync::Arc;

/// Provides the file extension an artifact written through `self` carries.
pub trait FileExtProvider {
    fn file_ext(&self) -> Option<Arc<str>>;
}
