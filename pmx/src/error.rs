use thiserror::Error;

use crate::Format;

#[derive(Error, Debug)]
pub enum ExportError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("could not reserve space for {what} ({count} entries)")]
    OutOfMemory { what: &'static str, count: usize },

    #[error("triangle count mismatch: accounted {accounted}, written {written}")]
    TriangleCountMismatch { accounted: usize, written: usize },

    #[error("node {node} references parent {parent}, which is not emitted before it")]
    NodeOrder { node: usize, parent: usize },

    #[error("{section} section declares {declared} records but {written} were written")]
    SectionCount { section: &'static str, declared: usize, written: usize },

    #[error("{what} index {index} does not fit the {format} layout")]
    IndexOverflow { what: &'static str, index: usize, format: Format },

    #[error("vertex {vertex} is bound to bone {bone}, but only {bones} bones are written")]
    DanglingBone { vertex: usize, bone: usize, bones: usize },

    #[error("invalid host data: {0}")]
    Source(String),

    #[error("malformed model file: {0}")]
    Format(String),

    #[error("glTF error: {0}")]
    Gltf(#[from] gltf::Error),

    #[error("settings error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, ExportError>;
