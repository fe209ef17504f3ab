use thiserror::Error;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Cache storage error: {context}")]
    Persistence {
        context: String,
        #[source]
        source: BoxError,
    },

    #[error("Cache is closed")]
    Closed,

    #[error("Failed to acquire cache lock")]
    Lock,
}

impl CacheError {
    pub fn persistence(context: impl Into<String>, source: impl Into<BoxError>) -> Self {
        CacheError::Persistence {
            context: context.into(),
            source: source.into(),
        }
    }
}
