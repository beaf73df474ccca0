//! The legacy fixed-field layout: Shift-JIS names, 16-bit indices, two bones per vertex.

use std::io::Write;

use byteorder::{WriteBytesExt, LE};

use crate::convert::{ExportModel, ExportVertex};
use crate::morph::MorphOffset;
use crate::skeleton::{NodeRole, SkeletonNode};
use crate::write::{quantize_weights, write_fixed_str, write_section, Serialize, Space};
use crate::{ExportError, ExportSettings, Format, MorphCategory, PmdBoneKind, Result};

const NAME_LEN: usize = 20;
const COMMENT_LEN: usize = 256;
const FRAME_NAME_LEN: usize = 50;
const TOON_NAME_LEN: usize = 100;
const NO_BONE: u16 = 0xFFFF;

fn narrow<T: TryFrom<usize>>(index: usize, what: &'static str) -> Result<T> {
    T::try_from(index).map_err(|_| ExportError::IndexOverflow { what, index, format: Format::Pmd })
}

fn bone_index(index: usize) -> Result<u16> {
    match narrow::<u16>(index, "bone")? {
        NO_BONE => Err(ExportError::IndexOverflow { what: "bone", index, format: Format::Pmd }),
        index => Ok(index),
    }
}

/// Only two influences fit; the primary weight is stored as a percentage and
/// the secondary is its complement.
fn two_bone_skin(weights: &[(usize, f32)]) -> (usize, usize, u8) {
    match *weights {
        [] => (0, 0, 100),
        [(a, _)] => (a, a, 100),
        [(a, wa), (b, wb), ..] => {
            let total = wa + wb;
            let q = quantize_weights(&[wa / total, wb / total]);
            (a, b, (q[0] * 100.0).round() as u8)
        }
    }
}

fn write_vertex(w: &mut impl Write, space: &Space, vert: &ExportVertex) -> Result<()> {
    space.point(vert.position).write_to(w)?;
    space.direction(vert.normal).write_to(w)?;
    vert.uv.write_to(w)?;
    let (a, b, weight) = two_bone_skin(&vert.weights);
    bone_index(a)?.write_to(w)?;
    bone_index(b)?.write_to(w)?;
    weight.write_to(w)?;
    // 0 draws the edge
    u8::from(!vert.edge).write_to(w)?;
    Ok(())
}

/// Role code plus the (tail, ik) pair, whose meaning depends on the role.
fn bone_kind(node: &SkeletonNode) -> Result<(PmdBoneKind, u16, u16)> {
    let tail = match node.tail {
        Some(tail) => bone_index(tail)?,
        None => 0,
    };
    let kind = match node.role {
        NodeRole::Ik => return Ok((PmdBoneKind::Ik, tail, 0)),
        NodeRole::IkEnd => return Ok((PmdBoneKind::IkTip, tail, 0)),
        NodeRole::Root | NodeRole::Tip => {
            if let Some(link) = node.link {
                let target = bone_index(link.node)?;
                return Ok(if link.rate == 100 {
                    (PmdBoneKind::UnderRotation, tail, target)
                } else {
                    // the tail field carries the rate for partial links
                    (PmdBoneKind::RotationLink, link.rate.clamp(0, u16::MAX as i32) as u16, target)
                });
            }
            if let Some(ik) = node.ik_controller {
                return Ok((PmdBoneKind::UnderIk, tail, bone_index(ik)?));
            }
            if node.hidden {
                PmdBoneKind::Hidden
            } else if node.twist {
                PmdBoneKind::Twist
            } else if node.movable {
                PmdBoneKind::RotateMove
            } else {
                PmdBoneKind::Rotate
            }
        }
    };
    Ok((kind, tail, 0))
}

fn write_morph_offsets(w: &mut impl Write, offsets: impl Iterator<Item = Result<(u32, crate::Vec3d)>>) -> Result<usize> {
    let mut written = 0;
    for offset in offsets {
        let (index, vec) = offset?;
        index.write_to(w)?;
        vec.write_to(w)?;
        written += 1;
    }
    Ok(written)
}

pub(crate) fn write_pmd(model: &ExportModel, w: &mut impl Write, settings: &ExportSettings) -> Result<()> {
    let space = Space::new(settings.scale);

    if model.vertices.len() > u16::MAX as usize + 1 {
        return Err(ExportError::IndexOverflow { what: "vertex", index: model.vertices.len() - 1, format: Format::Pmd });
    }

    // header
    w.write_all(Format::PMD_MAGIC)?;
    Format::PMD_VERSION.write_to(w)?;
    write_fixed_str(w, &model.name, NAME_LEN)?;
    write_fixed_str(w, &model.comment, COMMENT_LEN)?;

    // vertices
    let declared = model.vertices.len();
    w.write_u32::<LE>(narrow(declared, "vertex count")?)?;
    write_section(w, "vertex", declared, |w| {
        for vert in &model.vertices {
            write_vertex(w, &space, vert)?;
        }
        Ok(model.vertices.len())
    })?;

    // faces, wound the other way round to stay front facing after the mirror
    let declared = model.index_count();
    w.write_u32::<LE>(narrow(declared, "index count")?)?;
    write_section(w, "face index", declared, |w| {
        let mut written = 0;
        for &[a, b, c] in &model.triangles {
            for index in [a, c, b] {
                narrow::<u16>(index, "vertex")?.write_to(w)?;
                written += 1;
            }
        }
        Ok(written)
    })?;

    // materials
    let declared = model.materials.len();
    w.write_u32::<LE>(narrow(declared, "material count")?)?;
    write_section(w, "material", declared, |w| {
        for out in &model.materials {
            let mat = &out.material;
            [mat.diffuse[0], mat.diffuse[1], mat.diffuse[2]].write_to(w)?;
            mat.diffuse[3].write_to(w)?;
            mat.specular_power.write_to(w)?;
            mat.specular.write_to(w)?;
            mat.ambient.write_to(w)?;
            mat.toon.filter(|&toon| toon < 10).unwrap_or(0xFF).write_to(w)?;
            u8::from(mat.edge).write_to(w)?;
            narrow::<u32>(out.triangle_count * 3, "material index count")?.write_to(w)?;
            let texture = match (&mat.texture, &mat.sphere_texture) {
                (Some(tex), Some(sphere)) => format!("{}*{}", tex, sphere),
                (Some(tex), None) => tex.clone(),
                (None, Some(sphere)) => sphere.clone(),
                (None, None) => String::new(),
            };
            write_fixed_str(w, &texture, NAME_LEN)?;
        }
        Ok(model.materials.len())
    })?;

    // bones
    let declared = model.nodes.len();
    if declared > 0 {
        bone_index(declared - 1)?;
    }
    w.write_u16::<LE>(narrow(declared, "bone count")?)?;
    write_section(w, "bone", declared, |w| {
        for node in &model.nodes {
            write_fixed_str(w, &node.name, NAME_LEN)?;
            let parent = match node.parent {
                Some(parent) => bone_index(parent)?,
                None => NO_BONE,
            };
            parent.write_to(w)?;
            let (kind, tail, ik) = bone_kind(node)?;
            tail.write_to(w)?;
            kind.write_to(w)?;
            ik.write_to(w)?;
            space.point(node.position).write_to(w)?;
        }
        Ok(model.nodes.len())
    })?;

    // IK
    let declared = model.ik_chains.len();
    w.write_u16::<LE>(narrow(declared, "IK count")?)?;
    write_section(w, "IK", declared, |w| {
        for chain in &model.ik_chains {
            bone_index(chain.ik_node)?.write_to(w)?;
            bone_index(chain.target)?.write_to(w)?;
            narrow::<u8>(chain.links.len(), "IK link count")?.write_to(w)?;
            chain.iterations.write_to(w)?;
            chain.control_weight.write_to(w)?;
            for link in &chain.links {
                bone_index(link.node)?.write_to(w)?;
            }
        }
        Ok(model.ik_chains.len())
    })?;

    // morphs: the base record holds absolute positions, targets index into it
    let morphs = &model.morphs;
    let declared = if morphs.is_empty() { 0 } else { morphs.targets.len() + 1 };
    w.write_u16::<LE>(narrow(declared, "morph count")?)?;
    write_section(w, "morph", declared, |w| {
        if morphs.is_empty() {
            return Ok(0);
        }
        write_fixed_str(w, "base", NAME_LEN)?;
        narrow::<u32>(morphs.base.len(), "base morph size")?.write_to(w)?;
        MorphCategory::Base.write_to(w)?;
        let base = morphs.base.iter().map(|&MorphOffset { vertex, delta }| Ok((narrow(vertex, "vertex")?, space.point(delta))));
        let written = write_morph_offsets(w, base)?;
        if written != morphs.base.len() {
            return Err(ExportError::SectionCount { section: "base morph", declared: morphs.base.len(), written });
        }

        let lookup = morphs.base_lookup();
        for target in &morphs.targets {
            write_fixed_str(w, &target.name, NAME_LEN)?;
            narrow::<u32>(target.offsets.len(), "morph size")?.write_to(w)?;
            target.category.write_to(w)?;
            let offsets = target.offsets.iter().map(|offset| {
                let index = lookup
                    .get(&offset.vertex)
                    .copied()
                    .ok_or(ExportError::IndexOverflow { what: "base morph vertex", index: offset.vertex, format: Format::Pmd })?;
                Ok((narrow(index, "base morph vertex")?, space.point(offset.delta)))
            });
            write_morph_offsets(w, offsets)?;
        }
        Ok(morphs.targets.len() + 1)
    })?;

    // morph display list, skipping the base record
    let declared = if morphs.is_empty() { 0 } else { morphs.targets.len() };
    w.write_u8(narrow(declared, "morph display count")?)?;
    write_section(w, "morph display", declared, |w| {
        for i in 0..declared {
            narrow::<u16>(i + 1, "morph")?.write_to(w)?;
        }
        Ok(declared)
    })?;

    // bone display frames
    let groups = &model.display_groups;
    w.write_u8(narrow(groups.len(), "display frame count")?)?;
    for group in groups {
        write_fixed_str(w, &group.name, FRAME_NAME_LEN)?;
    }
    let declared: usize = groups.iter().map(|group| group.nodes.len()).sum();
    w.write_u32::<LE>(narrow(declared, "bone display count")?)?;
    write_section(w, "bone display", declared, |w| {
        let mut written = 0;
        for (frame, group) in groups.iter().enumerate() {
            for &node in &group.nodes {
                bone_index(node)?.write_to(w)?;
                narrow::<u8>(frame + 1, "display frame")?.write_to(w)?;
                written += 1;
            }
        }
        Ok(written)
    })?;

    // english names
    w.write_u8(1)?;
    write_fixed_str(w, &model.english_name, NAME_LEN)?;
    write_fixed_str(w, &model.english_comment, COMMENT_LEN)?;
    for node in &model.nodes {
        let name = if node.english_name.is_empty() { &node.name } else { &node.english_name };
        write_fixed_str(w, name, NAME_LEN)?;
    }
    if !morphs.is_empty() {
        for target in &morphs.targets {
            let name = if target.english_name.is_empty() { &target.name } else { &target.english_name };
            write_fixed_str(w, name, NAME_LEN)?;
        }
    }
    for group in groups {
        let name = if group.english_name.is_empty() { &group.name } else { &group.english_name };
        write_fixed_str(w, name, FRAME_NAME_LEN)?;
    }

    for i in 0..10 {
        write_fixed_str(w, model.toon_textures.get(i).map_or("", |name| name.as_str()), TOON_NAME_LEN)?;
    }

    // no physics
    w.write_u32::<LE>(0)?;
    w.write_u32::<LE>(0)?;

    log::debug!("PMD stream complete: {} vertices, {} bones", model.vertices.len(), model.nodes.len());
    Ok(())
}
