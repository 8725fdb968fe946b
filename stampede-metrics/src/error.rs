pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid histogram bounds: {0:?}")]
    HistogramBounds(hdrhistogram::CreationError),

    #[error("histogram significant figures must be in 1..=5 (got {0})")]
    SignificantFigures(u8),
}
