//! Builds a [`HostDocument`] from a glTF file, standing in for a live editor.
//!
//! Every mesh node becomes one object in world space. The joints of the first
//! skin become the bone rig; per-node `extras` carry the rig metadata glTF has
//! no slot for (IK chain length, rotation links, limits, display groups).

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use gltf::image::Source;
use gltf::mesh::Mode;
use nalgebra_glm as glm;
use serde::Deserialize;

use crate::{
    AngleLimits, BoneId, ExportError, HostDocument, MorphCategory, MorphTargetRef, Result, RigBone, RigGroup, SourceCorner, SourceFace,
    SourceMaterial, SourceObject, SourceVertex, Vec2d, Vec3d,
};

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct BoneExtras {
    english_name: Option<String>,
    ik_chain_length: Option<i32>,
    ik_name: Option<String>,
    movable: bool,
    dummy: bool,
    group: u32,
    group_name: Option<String>,
    /// name of the node whose rotation this bone follows
    link_target: Option<String>,
    link_rate: Option<i32>,
    /// degrees
    limit_min: Option<[f32; 3]>,
    limit_max: Option<[f32; 3]>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct MeshExtras {
    target_names: Vec<String>,
    target_categories: Vec<MorphCategory>,
}

fn parse_extras<T: Default + for<'de> Deserialize<'de>>(extras: &gltf::json::extras::Extras, what: &str) -> T {
    match extras.as_ref().map(|raw| serde_json::from_str(raw.get())) {
        Some(Ok(parsed)) => parsed,
        Some(Err(err)) => {
            log::warn!("ignoring malformed extras on {}: {}", what, err);
            T::default()
        }
        None => T::default(),
    }
}

/// World matrices and parent links of every node reachable from the scene.
struct Hierarchy {
    world: HashMap<usize, glm::Mat4>,
    parent: HashMap<usize, usize>,
    /// depth-first, parents before children
    order: Vec<usize>,
}

impl Hierarchy {
    fn build(doc: &gltf::Document) -> Result<Hierarchy> {
        let scene = doc
            .default_scene()
            .or_else(|| doc.scenes().next())
            .ok_or_else(|| ExportError::Source("glTF file has no scene".into()))?;
        let mut hierarchy = Hierarchy { world: HashMap::new(), parent: HashMap::new(), order: vec![] };
        let mut stack: Vec<(gltf::Node, glm::Mat4, Option<usize>)> =
            scene.nodes().map(|node| (node, glm::Mat4::identity(), None)).collect();
        stack.reverse();
        while let Some((node, parent_world, parent)) = stack.pop() {
            if hierarchy.world.contains_key(&node.index()) {
                log::warn!("node {} is reachable twice, keeping its first placement", node.index());
                continue;
            }
            let world = parent_world * glm::Mat4::from(node.transform().matrix());
            hierarchy.world.insert(node.index(), world);
            hierarchy.order.push(node.index());
            if let Some(parent) = parent {
                hierarchy.parent.insert(node.index(), parent);
            }
            let children: Vec<_> = node.children().collect();
            stack.extend(children.into_iter().rev().map(|child| (child, world, Some(node.index()))));
        }
        Ok(hierarchy)
    }

    fn position(&self, node: usize) -> Vec3d {
        self.world.get(&node).map_or(Vec3d::ZERO, |world| world * Vec3d::ZERO)
    }
}

fn transform_vector(world: &glm::Mat4, vec: [f32; 3]) -> Vec3d {
    world.transform_vector(&glm::Vec3::from(vec)).into()
}

fn pack_color([r, g, b, a]: [u8; 4]) -> u32 {
    u32::from_le_bytes([r, g, b, a])
}

fn import_materials(doc: &gltf::Document) -> Vec<SourceMaterial> {
    doc.materials()
        .map(|material| {
            let index = material.index().unwrap_or_default();
            let pbr = material.pbr_metallic_roughness();
            let texture = pbr.base_color_texture().map(|info| match info.texture().source().source() {
                Source::Uri { uri, .. } => urlencoding::decode(uri).map_or_else(|_| uri.to_string(), |uri| uri.into_owned()),
                Source::View { .. } => format!("texture{}.png", info.texture().index()),
            });
            SourceMaterial {
                name: material.name().map_or_else(|| format!("material{}", index), Into::into),
                diffuse: pbr.base_color_factor(),
                texture,
                double_sided: material.double_sided(),
                ..Default::default()
            }
        })
        .collect()
}

/// Joints of the first skin, keyed by node index. Ids start at 1.
fn import_rig(doc: &gltf::Document, hierarchy: &Hierarchy, host: &mut HostDocument) -> HashMap<usize, BoneId> {
    let Some(skin) = doc.skins().next() else {
        return HashMap::new();
    };
    if doc.skins().count() > 1 {
        log::warn!("only the first of {} skins is exported", doc.skins().count());
    }

    let joints: Vec<gltf::Node> = skin.joints().collect();
    let ids: HashMap<usize, BoneId> = joints.iter().enumerate().map(|(i, joint)| (joint.index(), BoneId(i as u32 + 1))).collect();
    let names: HashMap<&str, BoneId> = joints.iter().filter_map(|joint| Some((joint.name()?, ids[&joint.index()]))).collect();
    let mut groups = BTreeMap::new();

    for joint in &joints {
        let extras: BoneExtras = parse_extras(joint.extras(), "joint");
        let id = ids[&joint.index()];
        let parent = hierarchy.parent.get(&joint.index()).and_then(|parent| ids.get(parent)).copied().unwrap_or(BoneId::NONE);
        let root = hierarchy.position(joint.index());
        let first_child = joint.children().find(|child| ids.contains_key(&child.index()));
        let tip = match &first_child {
            Some(child) => hierarchy.position(child.index()),
            // a leaf continues its parent's direction
            None if !parent.is_none() => {
                let parent_root = joints.iter().find(|j| ids[&j.index()] == parent).map_or(root, |j| hierarchy.position(j.index()));
                root + (root - parent_root) * 0.5
            }
            None => root + Vec3d::new(0.0, 0.1, 0.0),
        };
        let link_target = match &extras.link_target {
            Some(name) => names.get(name.as_str()).copied().unwrap_or_else(|| {
                log::warn!("link target {:?} of joint {:?} is not a joint", name, joint.name());
                BoneId::NONE
            }),
            None => BoneId::NONE,
        };
        if let Some(name) = extras.group_name {
            groups.entry(extras.group).or_insert(name);
        }
        let name = joint.name().map_or_else(|| format!("bone{}", id.0), Into::into);

        host.rig.bones.push(RigBone {
            id,
            parent,
            english_name: extras.english_name.unwrap_or_else(|| name.clone()),
            name,
            root,
            tip,
            ik_chain_length: extras.ik_chain_length.unwrap_or(-1),
            ik_name: extras.ik_name.unwrap_or_default(),
            is_dummy: extras.dummy,
            is_end_point: first_child.is_none(),
            is_movable: extras.movable,
            link_target,
            link_rotate_rate: extras.link_rate.unwrap_or(100),
            group: extras.group,
            limits: match (extras.limit_min, extras.limit_max) {
                (None, None) => AngleLimits::default(),
                (min, max) => AngleLimits {
                    min: min.map_or(AngleLimits::default().min, Into::into),
                    max: max.map_or(AngleLimits::default().max, Into::into),
                },
            },
            tip_bone: first_child.map_or(BoneId::NONE, |child| ids[&child.index()]),
        });
    }

    host.rig.groups = groups.into_iter().map(|(id, name)| RigGroup { id, english_name: name.clone(), name }).collect();
    ids
}

/// Per-target position deltas, by object vertex index.
type TargetDeltas = Vec<Vec<(usize, Vec3d)>>;

fn import_mesh_node(
    node: &gltf::Node, world: &glm::Mat4, buffers: &[gltf::buffer::Data], bone_ids: &HashMap<usize, BoneId>, host: &mut HostDocument,
) -> Result<()> {
    let Some(mesh) = node.mesh() else {
        return Ok(());
    };
    let object_index = host.scene.objects.len();
    let mut object = SourceObject {
        name: node.name().or_else(|| mesh.name()).map_or_else(|| format!("object{}", object_index), Into::into),
        visible: true,
        ..Default::default()
    };
    let skin_joints: Vec<Option<BoneId>> =
        node.skin().map(|skin| skin.joints().map(|joint| bone_ids.get(&joint.index()).copied()).collect()).unwrap_or_default();
    let mut deltas: TargetDeltas = vec![];

    for primitive in mesh.primitives() {
        if primitive.mode() != Mode::Triangles {
            log::warn!("skipping {:?} primitive in {:?}", primitive.mode(), object.name);
            continue;
        }
        let reader = primitive.reader(|buffer| Some(&buffers[buffer.index()]));
        let Some(positions) = reader.read_positions() else {
            log::warn!("skipping primitive without positions in {:?}", object.name);
            continue;
        };
        let offset = object.vertices.len();
        object.vertices.extend(positions.enumerate().map(|(i, pos)| SourceVertex {
            position: world * Vec3d::from(pos),
            unique_id: (offset + i) as u32,
        }));
        let count = object.vertices.len() - offset;

        let normals: Vec<Vec3d> = match reader.read_normals() {
            Some(normals) => normals.map(|normal| transform_vector(world, normal).normalize()).collect(),
            None => vec![Vec3d::new(0.0, 1.0, 0.0); count],
        };
        let uvs: Vec<Vec2d> = match reader.read_tex_coords(0) {
            Some(uvs) => uvs.into_f32().map(Vec2d::from).collect(),
            None => vec![Vec2d::default(); count],
        };
        let colors: Vec<u32> = match reader.read_colors(0) {
            Some(colors) => colors.into_rgba_u8().map(pack_color).collect(),
            None => vec![u32::MAX; count],
        };
        let indices: Vec<usize> = match reader.read_indices() {
            Some(indices) => indices.into_u32().map(|i| i as usize).collect(),
            None => (0..count).collect(),
        };
        if [normals.len(), uvs.len(), colors.len()].iter().any(|&len| len != count) {
            return Err(ExportError::Source(format!("attribute counts disagree in {:?}", object.name)));
        }
        if let Some(&bad) = indices.iter().find(|&&i| i >= count) {
            return Err(ExportError::Source(format!("index {} out of range in {:?}", bad, object.name)));
        }

        let material = primitive.material().index();
        for tri in indices.chunks_exact(3) {
            let corners = tri
                .iter()
                .map(|&i| SourceCorner { vertex: offset + i, normal: normals[i], uv: uvs[i], color: colors[i] })
                .collect();
            object.faces.push(SourceFace { material, corners });
        }

        if let (Some(joints), Some(weights)) = (reader.read_joints(0), reader.read_weights(0)) {
            for (i, (joints, weights)) in joints.into_u16().zip(weights.into_f32()).enumerate() {
                let influences = joints
                    .iter()
                    .zip(weights)
                    .filter(|&(_, weight)| weight > 0.0)
                    .filter_map(|(&joint, weight)| Some((skin_joints.get(joint as usize).copied().flatten()?, weight)))
                    .collect::<Vec<_>>();
                if !influences.is_empty() {
                    host.rig.weights.insert((object_index, (offset + i) as u32), influences);
                }
            }
        }

        for (target, (positions, _, _)) in reader.read_morph_targets().enumerate() {
            if deltas.len() <= target {
                deltas.resize_with(target + 1, Vec::new);
            }
            if let Some(positions) = positions {
                deltas[target].extend(positions.enumerate().map(|(i, delta)| (offset + i, transform_vector(world, delta))));
            }
        }
    }

    let extras: MeshExtras = parse_extras(mesh.extras(), "mesh");
    host.scene.objects.push(object);

    let mut targets = vec![];
    for (target, offsets) in deltas.into_iter().enumerate() {
        let base = &host.scene.objects[object_index];
        let name = extras.target_names.get(target).cloned().unwrap_or_else(|| format!("morph{}", target));
        let mut pose = SourceObject { name: format!("{}.{}", base.name, name), visible: false, ..base.clone() };
        for (vertex, delta) in offsets {
            pose.vertices[vertex].position += delta;
        }
        targets.push(MorphTargetRef {
            object: host.scene.objects.len(),
            english_name: name.clone(),
            name,
            category: extras.target_categories.get(target).copied().unwrap_or(MorphCategory::Other),
        });
        host.scene.objects.push(pose);
    }
    if !targets.is_empty() {
        host.morphs.targets.insert(object_index, targets);
    }
    Ok(())
}

/// Loads a `.gltf` or `.glb` file. Images are never decoded; only texture URIs are kept.
pub fn import_gltf(path: impl AsRef<Path>) -> Result<HostDocument> {
    let path = path.as_ref();
    let gltf::Gltf { document, blob } = gltf::Gltf::open(path)?;
    let buffers = gltf::import_buffers(&document, path.parent(), blob)?;
    let hierarchy = Hierarchy::build(&document)?;

    let mut host = HostDocument::default();
    host.scene.materials = import_materials(&document);
    let bone_ids = import_rig(&document, &hierarchy, &mut host);

    for &index in &hierarchy.order {
        let Some(node) = document.nodes().nth(index) else {
            continue;
        };
        import_mesh_node(&node, &hierarchy.world[&index], &buffers, &bone_ids, &mut host)?;
    }

    log::info!(
        "imported {:?}: {} objects, {} materials, {} bones",
        path,
        host.scene.objects.len(),
        host.scene.materials.len(),
        host.rig.bones.len()
    );
    Ok(host)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn colors_pack_red_low() {
        assert_eq!(pack_color([0x11, 0x22, 0x33, 0x44]), 0x4433_2211);
    }

    #[test]
    fn extras_fall_back_to_defaults() {
        let raw = serde_json::value::RawValue::from_string(r#"{"ik_chain_length": 2, "movable": true}"#.into()).unwrap();
        let extras: BoneExtras = parse_extras(&Some(raw), "joint");
        assert_eq!(extras.ik_chain_length, Some(2));
        assert!(extras.movable);
        assert!(!extras.dummy);

        let raw = serde_json::value::RawValue::from_string("[1, 2]".into()).unwrap();
        let extras: BoneExtras = parse_extras(&Some(raw), "joint");
        assert_eq!(extras.ik_chain_length, None);

        let extras: MeshExtras = parse_extras(&None, "mesh");
        assert!(extras.target_names.is_empty());
    }

    #[test]
    fn mesh_extras_use_gltf_casing() {
        let raw = serde_json::value::RawValue::from_string(r#"{"targetNames": ["smile"], "targetCategories": ["lip"]}"#.into()).unwrap();
        let extras: MeshExtras = parse_extras(&Some(raw), "mesh");
        assert_eq!(extras.target_names, ["smile"]);
        assert_eq!(extras.target_categories, [MorphCategory::Lip]);
    }
}
