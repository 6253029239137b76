//! Error types for yolo-ffi

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("image error: {0}")]
    Image(#[from] image::ImageError),

    #[error(transparent)]
    Model(#[from] yolo_export::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("model expects input {0:?}, need [1, 3, height, width]")]
    UnsupportedInput([usize; 4]),

    #[error("unexpected model output shape {0:?}")]
    UnexpectedOutput(Vec<usize>),
}

pub type Result<T> = std::result::Result<T, Error>;
