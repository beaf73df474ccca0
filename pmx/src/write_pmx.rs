//! The extended layout: UTF-16 strings, variable width indices, up to four bones per vertex.

use std::collections::HashMap;
use std::io::Write;

use byteorder::{WriteBytesExt, LE};

use crate::convert::{ExportModel, ExportVertex};
use crate::ik::IkChain;
use crate::skeleton::{NodeRole, SkeletonNode};
use crate::write::{quantize_weights, write_section, write_utf16, IndexSize, Serialize, Space};
use crate::{bone_flags, ExportError, ExportSettings, Format, Result, Vec3d};

const WEIGHT_BDEF2: u8 = 1;
const WEIGHT_BDEF4: u8 = 2;

const DRAW_DOUBLE_SIDED: u8 = 0x01;
const DRAW_GROUND_SHADOW: u8 = 0x02;
const DRAW_SELF_SHADOW_MAP: u8 = 0x04;
const DRAW_SELF_SHADOW: u8 = 0x08;
const DRAW_EDGE: u8 = 0x10;

const MORPH_VERTEX: u8 = 1;

fn count(n: usize, what: &'static str) -> Result<i32> {
    i32::try_from(n).map_err(|_| ExportError::IndexOverflow { what, index: n, format: Format::Pmx })
}

struct Layout {
    vertex: IndexSize,
    texture: IndexSize,
    material: IndexSize,
    bone: IndexSize,
    morph: IndexSize,
    rigid: IndexSize,
}

/// Texture paths referenced by the materials, each listed once.
fn texture_table(model: &ExportModel) -> (Vec<&str>, HashMap<&str, usize>) {
    let mut table = vec![];
    let mut lookup = HashMap::new();
    for out in &model.materials {
        for path in [&out.material.texture, &out.material.sphere_texture].into_iter().flatten() {
            lookup.entry(path.as_str()).or_insert_with(|| {
                table.push(path.as_str());
                table.len() - 1
            });
        }
    }
    (table, lookup)
}

fn write_vertex(w: &mut impl Write, layout: &Layout, space: &Space, vert: &ExportVertex) -> Result<()> {
    space.point(vert.position).write_to(w)?;
    space.direction(vert.normal).write_to(w)?;
    vert.uv.write_to(w)?;

    let bones: Vec<usize> = vert.weights.iter().map(|&(node, _)| node).collect();
    let weights: Vec<f32> = vert.weights.iter().map(|&(_, weight)| weight).collect();
    match *bones {
        [] | [_] => {
            let bone = bones.first().copied().unwrap_or(0);
            WEIGHT_BDEF2.write_to(w)?;
            layout.bone.write(w, Some(bone))?;
            layout.bone.write(w, Some(bone))?;
            1f32.write_to(w)?;
        }
        [a, b] => {
            WEIGHT_BDEF2.write_to(w)?;
            layout.bone.write(w, Some(a))?;
            layout.bone.write(w, Some(b))?;
            quantize_weights(&weights)[0].write_to(w)?;
        }
        _ => {
            WEIGHT_BDEF4.write_to(w)?;
            let quantized = quantize_weights(&weights);
            for i in 0..4 {
                layout.bone.write(w, bones.get(i).copied())?;
            }
            for i in 0..4 {
                quantized.get(i).copied().unwrap_or(0.0).write_to(w)?;
            }
        }
    }

    // edge scale
    (if vert.edge { 1f32 } else { 0f32 }).write_to(w)?;
    Ok(())
}

fn bone_flag_word(node: &SkeletonNode, fixed_axis: Option<Vec3d>) -> u16 {
    let mut flags = bone_flags::TAIL_IS_BONE | bone_flags::ROTATABLE;
    if node.movable {
        flags |= bone_flags::MOVABLE;
    }
    if !node.hidden {
        flags |= bone_flags::VISIBLE | bone_flags::OPERABLE;
    }
    if node.role == NodeRole::Ik {
        flags |= bone_flags::IK;
    }
    if node.link.is_some() {
        flags |= bone_flags::INHERIT_ROTATION;
    }
    if fixed_axis.is_some() {
        flags |= bone_flags::FIXED_AXIS;
    }
    flags
}

/// Twist joints rotate about the axis towards their tail.
fn twist_axis(model: &ExportModel, node: &SkeletonNode) -> Option<Vec3d> {
    if !node.twist {
        return None;
    }
    let tail = model.nodes.get(node.tail?)?;
    let axis = (tail.position - node.position).normalize();
    (!axis.is_null()).then_some(axis)
}

fn write_bone(w: &mut impl Write, layout: &Layout, space: &Space, model: &ExportModel, node: &SkeletonNode, chain: Option<&IkChain>) -> Result<()> {
    write_utf16(w, &node.name)?;
    write_utf16(w, &node.english_name)?;
    space.point(node.position).write_to(w)?;
    layout.bone.write(w, node.parent)?;
    // deform layer
    0i32.write_to(w)?;

    let fixed_axis = twist_axis(model, node);
    bone_flag_word(node, fixed_axis).write_to(w)?;
    layout.bone.write(w, node.tail)?;

    if let Some(link) = node.link {
        layout.bone.write(w, Some(link.node))?;
        (link.rate as f32 / 100.0).write_to(w)?;
    }
    if let Some(axis) = fixed_axis {
        space.direction(axis).write_to(w)?;
    }

    if let Some(chain) = chain {
        layout.bone.write(w, Some(chain.target))?;
        i32::from(chain.iterations).write_to(w)?;
        // limit angle per iteration, in radians
        (chain.control_weight * 4.0).write_to(w)?;
        count(chain.links.len(), "IK link count")?.write_to(w)?;
        for link in &chain.links {
            layout.bone.write(w, Some(link.node))?;
            let limits = model.nodes[link.node].limits;
            if limits.is_unlimited() {
                0u8.write_to(w)?;
            } else {
                1u8.write_to(w)?;
                let (min, max) = space.angle_limits(&limits);
                min.write_to(w)?;
                max.write_to(w)?;
            }
        }
    }
    Ok(())
}

pub(crate) fn write_pmx(model: &ExportModel, w: &mut impl Write, settings: &ExportSettings) -> Result<()> {
    let space = Space::new(settings.scale);
    let (textures, texture_index) = texture_table(model);
    let morphs = &model.morphs.targets;

    let layout = Layout {
        vertex: IndexSize::for_vertices(model.vertices.len()),
        texture: IndexSize::for_count(textures.len()),
        material: IndexSize::for_count(model.materials.len()),
        bone: IndexSize::for_count(model.nodes.len()),
        morph: IndexSize::for_count(morphs.len()),
        rigid: IndexSize::One,
    };

    // header
    w.write_all(Format::PMX_MAGIC)?;
    Format::PMX_VERSION.write_to(w)?;
    8u8.write_to(w)?;
    // UTF-16LE, no additional UVs, then the index widths
    [0u8, 0].write_to(w)?;
    for size in [layout.vertex, layout.texture, layout.material, layout.bone, layout.morph, layout.rigid] {
        (size as u8).write_to(w)?;
    }
    write_utf16(w, &model.name)?;
    write_utf16(w, &model.english_name)?;
    write_utf16(w, &model.comment)?;
    write_utf16(w, &model.english_comment)?;

    // vertices
    let declared = model.vertices.len();
    count(declared, "vertex count")?.write_to(w)?;
    write_section(w, "vertex", declared, |w| {
        for vert in &model.vertices {
            write_vertex(w, &layout, &space, vert)?;
        }
        Ok(model.vertices.len())
    })?;

    // faces, reversed to stay front facing after the mirror
    let declared = model.index_count();
    count(declared, "index count")?.write_to(w)?;
    write_section(w, "face index", declared, |w| {
        let mut written = 0;
        for &[a, b, c] in &model.triangles {
            for index in [a, c, b] {
                layout.vertex.write_vertex(w, index)?;
                written += 1;
            }
        }
        Ok(written)
    })?;

    count(textures.len(), "texture count")?.write_to(w)?;
    for path in &textures {
        write_utf16(w, path)?;
    }

    // materials
    let declared = model.materials.len();
    count(declared, "material count")?.write_to(w)?;
    write_section(w, "material", declared, |w| {
        for out in &model.materials {
            let mat = &out.material;
            write_utf16(w, &mat.name)?;
            write_utf16(w, &mat.english_name)?;
            mat.diffuse.write_to(w)?;
            mat.specular.write_to(w)?;
            mat.specular_power.write_to(w)?;
            mat.ambient.write_to(w)?;

            let mut draw = DRAW_GROUND_SHADOW | DRAW_SELF_SHADOW_MAP | DRAW_SELF_SHADOW;
            if mat.double_sided {
                draw |= DRAW_DOUBLE_SIDED;
            }
            if mat.edge {
                draw |= DRAW_EDGE;
            }
            draw.write_to(w)?;
            // edge colour and size
            [0f32, 0.0, 0.0, 1.0].write_to(w)?;
            1f32.write_to(w)?;

            let lookup = |path: &Option<String>| path.as_deref().and_then(|path| texture_index.get(path).copied());
            layout.texture.write(w, lookup(&mat.texture))?;
            let sphere = lookup(&mat.sphere_texture);
            layout.texture.write(w, sphere)?;
            (if sphere.is_some() { mat.sphere_mode } else { 0 }).write_to(w)?;
            match mat.toon.filter(|&toon| toon < 10) {
                Some(toon) => {
                    1u8.write_to(w)?;
                    toon.write_to(w)?;
                }
                None => {
                    0u8.write_to(w)?;
                    layout.texture.write(w, None)?;
                }
            }
            // memo
            write_utf16(w, "")?;
            count(out.triangle_count * 3, "material index count")?.write_to(w)?;
        }
        Ok(model.materials.len())
    })?;

    // bones
    let chains: HashMap<usize, &IkChain> = model.ik_chains.iter().map(|chain| (chain.ik_node, chain)).collect();
    let declared = model.nodes.len();
    count(declared, "bone count")?.write_to(w)?;
    write_section(w, "bone", declared, |w| {
        for node in &model.nodes {
            let chain = if node.role == NodeRole::Ik { chains.get(&node.index).copied() } else { None };
            write_bone(w, &layout, &space, model, node, chain)?;
        }
        Ok(model.nodes.len())
    })?;

    // morphs
    let declared = morphs.len();
    count(declared, "morph count")?.write_to(w)?;
    write_section(w, "morph", declared, |w| {
        for target in morphs {
            write_utf16(w, &target.name)?;
            write_utf16(w, &target.english_name)?;
            target.category.write_to(w)?;
            MORPH_VERTEX.write_to(w)?;
            count(target.offsets.len(), "morph size")?.write_to(w)?;
            for offset in &target.offsets {
                layout.vertex.write_vertex(w, offset.vertex)?;
                space.point(offset.delta).write_to(w)?;
            }
        }
        Ok(morphs.len())
    })?;

    // display frames: root, expressions, then one per group
    let declared = 2 + model.display_groups.len();
    count(declared, "display frame count")?.write_to(w)?;
    write_section(w, "display frame", declared, |w| {
        write_utf16(w, "Root")?;
        write_utf16(w, "Root")?;
        1u8.write_to(w)?;
        let roots: i32 = if model.nodes.is_empty() { 0 } else { 1 };
        roots.write_to(w)?;
        if roots == 1 {
            0u8.write_to(w)?;
            layout.bone.write(w, Some(0))?;
        }

        write_utf16(w, "表情")?;
        write_utf16(w, "Exp")?;
        1u8.write_to(w)?;
        count(morphs.len(), "morph display count")?.write_to(w)?;
        for i in 0..morphs.len() {
            1u8.write_to(w)?;
            layout.morph.write(w, Some(i))?;
        }

        for group in &model.display_groups {
            write_utf16(w, &group.name)?;
            write_utf16(w, &group.english_name)?;
            0u8.write_to(w)?;
            count(group.nodes.len(), "display frame size")?.write_to(w)?;
            for &node in &group.nodes {
                0u8.write_to(w)?;
                layout.bone.write(w, Some(node))?;
            }
        }
        Ok(2 + model.display_groups.len())
    })?;

    // no physics
    0i32.write_to(w)?;
    0i32.write_to(w)?;

    log::debug!(
        "PMX stream complete: {} vertices, {} bones, index widths v{} b{}",
        model.vertices.len(),
        model.nodes.len(),
        layout.vertex as u8,
        layout.bone as u8
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::convert::tests::sample_document;
    use crate::convert::Converter;
    use crate::skeleton::RotationLink;
    use crate::{BoneId, SourceMaterial};

    fn sample() -> (ExportModel, Vec<u8>) {
        let settings = ExportSettings::default();
        let model = Converter::new(&settings).convert_document(&sample_document()).unwrap();
        let mut buf = vec![];
        model.write(&mut buf, &settings).unwrap();
        (model, buf)
    }

    #[test]
    fn header_declares_index_widths() {
        let (_, buf) = sample();
        assert_eq!(&buf[..4], b"PMX ");
        assert_eq!(f32::from_le_bytes(buf[4..8].try_into().unwrap()), 2.0);
        assert_eq!(buf[8], 8);
        // encoding, extra uvs, vertex, texture, material, bone, morph, rigid
        assert_eq!(&buf[9..17], &[0, 0, 1, 1, 1, 1, 1, 1]);
        // name "model" as UTF-16
        assert_eq!(i32::from_le_bytes(buf[17..21].try_into().unwrap()), 10);
    }

    #[test]
    fn vertices_with_two_influences_use_bdef2() {
        let (model, _) = sample();
        let layout = Layout {
            vertex: IndexSize::One,
            texture: IndexSize::One,
            material: IndexSize::One,
            bone: IndexSize::One,
            morph: IndexSize::One,
            rigid: IndexSize::One,
        };
        let mut buf = vec![];
        write_vertex(&mut buf, &layout, &Space::new(1.0), &model.vertices[0]).unwrap();
        // pos, normal, uv, type, 2 bones, weight, edge
        assert_eq!(buf.len(), 32 + 1 + 2 + 4 + 4);
        assert_eq!(buf[32], WEIGHT_BDEF2);
        assert_eq!(f32::from_le_bytes(buf[35..39].try_into().unwrap()), 0.67);
    }

    #[test]
    fn many_influences_use_bdef4() {
        let layout = Layout {
            vertex: IndexSize::One,
            texture: IndexSize::One,
            material: IndexSize::One,
            bone: IndexSize::Two,
            morph: IndexSize::One,
            rigid: IndexSize::One,
        };
        let vert = ExportVertex {
            position: Vec3d::ZERO,
            normal: Vec3d::ZERO,
            uv: Default::default(),
            color: 0,
            weights: vec![(4, 0.5), (2, 0.3), (9, 0.2)],
            edge: false,
        };
        let mut buf = vec![];
        write_vertex(&mut buf, &layout, &Space::new(1.0), &vert).unwrap();
        assert_eq!(buf[32], WEIGHT_BDEF4);
        // the unused fourth slot is -1
        assert_eq!(&buf[39..41], &[0xFF, 0xFF]);
        let weights: Vec<f32> = (0..4).map(|i| f32::from_le_bytes(buf[41 + i * 4..45 + i * 4].try_into().unwrap())).collect();
        assert_eq!(weights[3], 0.0);
        assert!((weights.iter().sum::<f32>() - 1.0).abs() < 1e-5);
        // edge scale
        assert_eq!(f32::from_le_bytes(buf[57..61].try_into().unwrap()), 0.0);
    }

    #[test]
    fn flag_word_reflects_node_state() {
        let mut node = SkeletonNode::new(1, Some(0), Vec3d::ZERO, NodeRole::Tip, BoneId(1));
        assert_eq!(
            bone_flag_word(&node, None),
            bone_flags::TAIL_IS_BONE | bone_flags::ROTATABLE | bone_flags::VISIBLE | bone_flags::OPERABLE
        );
        node.hidden = true;
        node.link = Some(RotationLink { node: 0, rate: 50 });
        let flags = bone_flag_word(&node, Some(Vec3d::new(0.0, 1.0, 0.0)));
        assert_eq!(flags & bone_flags::VISIBLE, 0);
        assert_ne!(flags & bone_flags::INHERIT_ROTATION, 0);
        assert_ne!(flags & bone_flags::FIXED_AXIS, 0);

        node.role = NodeRole::Ik;
        node.movable = true;
        let flags = bone_flag_word(&node, None);
        assert_ne!(flags & bone_flags::IK, 0);
        assert_ne!(flags & bone_flags::MOVABLE, 0);
    }

    #[test]
    fn textures_are_listed_once() {
        let mut model = ExportModel::default();
        for (texture, sphere) in [("a.png", None), ("b.png", Some("env.sph")), ("a.png", Some("env.sph"))] {
            model.materials.push(crate::convert::ExportMaterial {
                material: SourceMaterial { texture: Some(texture.into()), sphere_texture: sphere.map(Into::into), ..Default::default() },
                triangle_count: 0,
            });
        }
        let (table, lookup) = texture_table(&model);
        assert_eq!(table, ["a.png", "b.png", "env.sph"]);
        assert_eq!(lookup["env.sph"], 2);
    }
}
