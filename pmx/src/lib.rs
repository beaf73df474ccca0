// #![warn(missing_docs)]

mod convert;
mod error;
mod ik;
mod import;
mod morph;
mod parse;
mod settings;
mod skeleton;
mod source;
mod types;
mod weld;
mod write;
mod write_pmd;
mod write_pmx;

pub use convert::{Converter, DisplayGroup, ExportMaterial, ExportModel, ExportVertex, MAX_INFLUENCES};
pub use error::{ExportError, Result};
pub use ik::{resolve_ik_chains, IkChain, IkLink, LinkAttachment};
pub use import::import_gltf;
pub use morph::{diff_morphs, MorphOffset, MorphTarget, Morphs, MORPH_EPSILON};
pub use parse::{ModelSummary, Parser};
pub use settings::*;
pub use skeleton::{build_skeleton, NodeRole, RotationLink, Skeleton, SkeletonNode};
pub use source::*;
pub use types::*;
pub use weld::{weld, WeldedMesh, WeldedVertex};
pub use write::{export_to_path, quantize_weight, quantize_weights};

/// Imports a glTF file and writes it out in the configured format.
pub fn export_gltf(input: impl AsRef<std::path::Path>, output: impl AsRef<std::path::Path>, settings: &ExportSettings) -> Result<ExportModel> {
    settings.validate()?;
    let document = import_gltf(input)?;
    let model = Converter::new(settings).convert_document(&document)?;
    export_to_path(&model, output, settings)?;
    Ok(model)
}
