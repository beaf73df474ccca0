//! The shared conversion pipeline. Everything format specific lives in the
//! writers; this module turns the host's view of the document into an
//! [`ExportModel`] that both back ends consume as-is.

use std::collections::{BTreeSet, HashMap};

use itertools::Itertools;

use crate::ik::{resolve_ik_chains, IkChain};
use crate::morph::{diff_morphs, Morphs};
use crate::skeleton::{build_skeleton, NodeRole, Skeleton, SkeletonNode};
use crate::weld::{weld, WeldedMesh};
use crate::{
    BoneId, ExportError, ExportSettings, HostDocument, MorphSource, Result, RigSource, SceneSource, SourceMaterial, Vec2d, Vec3d,
};

/// Most influences a vertex can carry in the extended format.
pub const MAX_INFLUENCES: usize = 4;

#[derive(Debug, Clone)]
pub struct ExportVertex {
    pub position: Vec3d,
    pub normal: Vec3d,
    pub uv: Vec2d,
    pub color: u32,
    /// (node, weight), heaviest first, summing to 1 when not empty
    pub weights: Vec<(usize, f32)>,
    pub edge: bool,
}

#[derive(Debug, Clone)]
pub struct ExportMaterial {
    pub material: SourceMaterial,
    pub triangle_count: usize,
}

#[derive(Debug, Clone, Default)]
pub struct DisplayGroup {
    pub name: String,
    pub english_name: String,
    pub nodes: Vec<usize>,
}

/// A fully converted model, independent of the output layout.
#[derive(Debug, Default)]
pub struct ExportModel {
    pub name: String,
    pub comment: String,
    pub english_name: String,
    pub english_comment: String,
    pub vertices: Vec<ExportVertex>,
    /// grouped by material, in material order
    pub triangles: Vec<[usize; 3]>,
    pub materials: Vec<ExportMaterial>,
    pub nodes: Vec<SkeletonNode>,
    pub ik_chains: Vec<IkChain>,
    pub morphs: Morphs,
    pub display_groups: Vec<DisplayGroup>,
    pub toon_textures: Vec<String>,
    /// a rig cycle was broken while building the skeleton
    pub cycle_broken: bool,
}

impl ExportModel {
    pub fn index_count(&self) -> usize {
        self.triangles.len() * 3
    }

    pub fn skinned(&self) -> bool {
        self.vertices.iter().any(|vert| !vert.weights.is_empty())
    }
}

struct ObjectOutput {
    object: usize,
    welded: WeldedMesh,
    offset: usize,
}

pub struct Converter<'a> {
    settings: &'a ExportSettings,
}

impl<'a> Converter<'a> {
    pub fn new(settings: &'a ExportSettings) -> Self {
        Converter { settings }
    }

    pub fn convert_document(&self, doc: &HostDocument) -> Result<ExportModel> {
        self.convert(&doc.scene, &doc.rig, &doc.morphs)
    }

    pub fn convert(&self, scene: &dyn SceneSource, rig: &dyn RigSource, morph_source: &dyn MorphSource) -> Result<ExportModel> {
        self.settings.validate()?;

        let mut skeleton = build_skeleton(rig.bones(), self.settings)?;
        let ik_chains = resolve_ik_chains(&mut skeleton, self.settings)?;
        if skeleton.nodes.is_empty() {
            // unbound vertices are written against node 0
            let mut center = SkeletonNode::new(0, None, Vec3d::ZERO, NodeRole::Root, BoneId::NONE);
            center.name = "センター".into();
            center.english_name = "center".into();
            center.movable = true;
            skeleton.push_node(center);
        }

        let objects = scene.objects();
        let bases = morph_source.base_objects();
        let morph_targets: BTreeSet<usize> = bases.iter().flat_map(|&base| morph_source.targets(base)).map(|target| target.object).collect();

        let mut outputs: Vec<ObjectOutput> = vec![];
        let mut vertices: Vec<ExportVertex> = vec![];
        for (i, object) in objects.iter().enumerate() {
            if morph_targets.contains(&i) {
                continue;
            }
            if !object.visible && !self.settings.export_hidden_objects {
                log::debug!("skipping hidden object {:?}", object.name);
                continue;
            }
            let welded = weld(object, self.settings.separate)?;
            let offset = vertices.len();
            vertices.try_reserve(welded.len()).map_err(|_| ExportError::OutOfMemory { what: "vertices", count: welded.len() })?;
            let mut dropped = 0;
            for vert in &welded.vertices {
                let source = &object.vertices[vert.original];
                let (weights, lost) = self.vertex_weights(&skeleton, rig.vertex_weights(i, source.unique_id));
                dropped += lost;
                vertices.push(ExportVertex {
                    position: source.position,
                    normal: vert.normal,
                    uv: vert.uv,
                    color: vert.color,
                    weights,
                    edge: false,
                });
            }
            if dropped > 0 {
                log::warn!("{:?}: dropped {} bone influence(s) beyond the first {}", object.name, dropped, MAX_INFLUENCES);
            }
            outputs.push(ObjectOutput { object: i, welded, offset });
        }

        let (materials, triangles) = self.collect_faces(scene, &outputs, &mut vertices)?;

        let mut morphs = Morphs::default();
        for base in bases {
            let Some(output) = outputs.iter().find(|output| output.object == base) else {
                log::debug!("morph base {} is not exported, skipping its targets", base);
                continue;
            };
            let refs = morph_source.targets(base);
            let pairs: Vec<_> = refs
                .iter()
                .filter_map(|target| match objects.get(target.object) {
                    Some(object) => Some((target, object)),
                    None => {
                        log::warn!("morph {:?} refers to missing object {}", target.name, target.object);
                        None
                    }
                })
                .collect();
            let by_original = output.welded.by_original(objects[base].vertices.len());
            morphs.merge(diff_morphs(&objects[base], &pairs, &by_original, output.offset));
        }

        let display_groups = self.display_groups(rig, &skeleton);

        let name = if self.settings.model_name.is_empty() { "model".to_string() } else { self.settings.model_name.clone() };
        let english_name = if self.settings.english_name.is_empty() { name.clone() } else { self.settings.english_name.clone() };

        let model = ExportModel {
            name,
            comment: self.settings.model_comment.clone(),
            english_name,
            english_comment: self.settings.english_comment.clone(),
            vertices,
            triangles,
            materials,
            nodes: skeleton.nodes,
            ik_chains,
            morphs,
            display_groups,
            toon_textures: self.settings.toon_textures.to_vec(),
            cycle_broken: skeleton.cycle_broken,
        };

        log::info!(
            "converted {:?}: {} vertices, {} triangles, {} materials, {} bones, {} IK chains, {} morphs",
            model.name,
            model.vertices.len(),
            model.triangles.len(),
            model.materials.len(),
            model.nodes.len(),
            model.ik_chains.len(),
            model.morphs.targets.len()
        );

        Ok(model)
    }

    /// Maps host weights onto root nodes, merges duplicates and keeps the
    /// heaviest influences. Returns the weights and how many were dropped.
    fn vertex_weights(&self, skeleton: &Skeleton, host: Vec<(BoneId, f32)>) -> (Vec<(usize, f32)>, usize) {
        let mut merged: Vec<(usize, f32)> = vec![];
        for (bone, weight) in host {
            if !(weight > 0.0) {
                continue;
            }
            let Some(node) = skeleton.node_for_bone(bone) else { continue };
            match merged.iter_mut().find(|(existing, _)| *existing == node) {
                Some((_, total)) => *total += weight,
                None => merged.push((node, weight)),
            }
        }

        // heaviest first, ties by node index so the result is deterministic
        merged.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
        let dropped = merged.len().saturating_sub(MAX_INFLUENCES);
        merged.truncate(MAX_INFLUENCES);

        let total: f32 = merged.iter().map(|(_, weight)| weight).sum();
        if total > 0.0 {
            for (_, weight) in &mut merged {
                *weight /= total;
            }
        }
        (merged, dropped)
    }

    /// Triangulates every exported face, grouped by material. Faces without a
    /// usable material go to a default material placed last.
    fn collect_faces(
        &self,
        scene: &dyn SceneSource,
        outputs: &[ObjectOutput],
        vertices: &mut [ExportVertex],
    ) -> Result<(Vec<ExportMaterial>, Vec<[usize; 3]>)> {
        let objects = scene.objects();
        let materials = scene.materials();
        let default_slot = materials.len();
        let slot_of = |material: Option<usize>| match material {
            Some(m) if m < materials.len() => m,
            _ => default_slot,
        };

        // accounting pass
        let mut counts = vec![0usize; materials.len() + 1];
        for output in outputs {
            for (f, face) in objects[output.object].faces.iter().enumerate() {
                if face.material.map_or(false, |m| m >= materials.len()) {
                    log::warn!("{:?} face {} uses missing material {:?}", objects[output.object].name, f, face.material);
                }
                counts[slot_of(face.material)] += scene.triangulate(output.object, f).len();
            }
        }
        let accounted: usize = counts.iter().sum();

        let mut triangles = vec![];
        triangles.try_reserve(accounted).map_err(|_| ExportError::OutOfMemory { what: "triangles", count: accounted })?;
        let mut out_materials = vec![];
        for slot in 0..=materials.len() {
            if counts[slot] == 0 {
                continue;
            }
            let material = match materials.get(slot) {
                Some(material) => material.clone(),
                None => SourceMaterial { name: "default".into(), english_name: "default".into(), ..Default::default() },
            };
            let start = triangles.len();
            for output in outputs {
                let object = &objects[output.object];
                for (f, face) in object.faces.iter().enumerate() {
                    if slot_of(face.material) != slot {
                        continue;
                    }
                    let corners = &output.welded.faces[f];
                    for tri in scene.triangulate(output.object, f) {
                        let Some(tri) = tri.iter().map(|&c| corners.get(c).map(|&v| output.offset + v)).collect::<Option<Vec<_>>>()
                        else {
                            return Err(ExportError::Source(format!("{:?} face {} triangulated to a missing corner", object.name, f)));
                        };
                        if material.edge {
                            for &v in &tri {
                                vertices[v].edge = true;
                            }
                        }
                        triangles.push([tri[0], tri[1], tri[2]]);
                    }
                }
            }
            out_materials.push(ExportMaterial { material, triangle_count: triangles.len() - start });
        }

        if triangles.len() != accounted {
            return Err(ExportError::TriangleCountMismatch { accounted, written: triangles.len() });
        }
        Ok((out_materials, triangles))
    }

    /// One group per rig group; nodes follow the group of the bone they rotate.
    fn display_groups(&self, rig: &dyn RigSource, skeleton: &Skeleton) -> Vec<DisplayGroup> {
        let visible = |node: &&SkeletonNode| !node.hidden && node.index != 0 && node.role != NodeRole::IkEnd;
        let groups = rig.groups();
        if groups.is_empty() {
            let nodes = skeleton.nodes.iter().filter(visible).map(|node| node.index).collect_vec();
            if nodes.is_empty() {
                return vec![];
            }
            return vec![DisplayGroup { name: "Bones".into(), english_name: "Bones".into(), nodes }];
        }

        let by_group: HashMap<u32, Vec<usize>> = skeleton.nodes.iter().filter(visible).map(|node| (node.group, node.index)).into_group_map();
        groups
            .into_iter()
            .filter_map(|group| {
                let nodes = by_group.get(&group.id)?.clone();
                Some(DisplayGroup { name: group.name, english_name: group.english_name, nodes })
            })
            .collect()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::skeleton::tests::chain;
    use crate::{MorphCategory, MorphTargetRef, RigGroup, SourceCorner, SourceFace, SourceObject, SourceVertex};

    fn corner(vertex: usize) -> SourceCorner {
        SourceCorner { vertex, normal: Vec3d::new(0.0, 0.0, 1.0), uv: Vec2d::new(vertex as f32, 0.0), color: 0xFFFF_FFFF }
    }

    pub(crate) fn quad_object(name: &str, material: Option<usize>) -> SourceObject {
        SourceObject {
            name: name.into(),
            visible: true,
            vertices: [[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [1.0, 1.0, 0.0], [0.0, 1.0, 0.0]]
                .iter()
                .enumerate()
                .map(|(i, &pos)| SourceVertex { position: pos.into(), unique_id: i as u32 })
                .collect(),
            faces: vec![SourceFace { material, corners: (0..4).map(corner).collect() }],
        }
    }

    /// A quad skinned to a three bone chain with one morph and an IK on the last bone.
    pub(crate) fn sample_document() -> HostDocument {
        let mut doc = HostDocument::default();
        doc.scene.objects.push(quad_object("body", Some(0)));
        let mut smile = quad_object("body.smile", None);
        smile.visible = false;
        smile.vertices[2].position = Vec3d::new(1.0, 1.5, 0.0);
        doc.scene.objects.push(smile);
        doc.scene.materials.push(SourceMaterial { name: "skin".into(), texture: Some("skin.png".into()), ..Default::default() });

        doc.rig.bones = chain();
        doc.rig.bones[2].ik_chain_length = 1;
        doc.rig.groups.push(RigGroup { id: 0, name: "body".into(), english_name: "Body".into() });
        for id in 0..4 {
            doc.rig.weights.insert((0, id), vec![(BoneId(1), 0.667), (BoneId(2), 0.333)]);
        }
        doc.morphs.targets.insert(
            0,
            vec![MorphTargetRef { object: 1, name: "smile".into(), english_name: "smile".into(), category: MorphCategory::Lip }],
        );
        doc
    }

    pub(crate) fn converted_sample() -> ExportModel {
        Converter::new(&ExportSettings::default()).convert_document(&sample_document()).unwrap()
    }

    #[test]
    fn sample_document_converts() {
        let model = Converter::new(&ExportSettings::default()).convert_document(&sample_document()).unwrap();
        assert_eq!(model.vertices.len(), 4);
        assert_eq!(model.triangles.len(), 2);
        assert_eq!(model.materials.len(), 1);
        assert_eq!(model.materials[0].triangle_count, 2);
        // 4 split nodes, 1 IK, 1 IK end
        assert_eq!(model.nodes.len(), 6);
        assert_eq!(model.ik_chains.len(), 1);
        assert_eq!(model.morphs.targets.len(), 1);
        assert_eq!(model.morphs.targets[0].offsets.len(), 1);
        assert!(model.vertices.iter().all(|vert| vert.edge));
    }

    #[test]
    fn morph_targets_and_hidden_objects_are_not_geometry() {
        let mut doc = sample_document();
        let mut hidden = quad_object("hidden", Some(0));
        hidden.visible = false;
        doc.scene.objects.push(hidden);
        let model = Converter::new(&ExportSettings::default()).convert_document(&doc).unwrap();
        assert_eq!(model.vertices.len(), 4);

        let settings = ExportSettings { export_hidden_objects: true, ..Default::default() };
        let model = Converter::new(&settings).convert_document(&doc).unwrap();
        assert_eq!(model.vertices.len(), 8);
    }

    #[test]
    fn faces_without_material_get_a_default_material_last() {
        let mut doc = sample_document();
        doc.scene.objects.push(quad_object("loose", None));
        let model = Converter::new(&ExportSettings::default()).convert_document(&doc).unwrap();
        let names: Vec<_> = model.materials.iter().map(|m| m.material.name.as_str()).collect();
        assert_eq!(names, ["skin", "default"]);
        assert_eq!(model.triangles.len(), 4);
        // the loose quad's vertices come after the body's
        assert!(model.triangles[2..].iter().flatten().all(|&v| v >= 4));
    }

    #[test]
    fn weights_are_mapped_to_root_nodes() {
        let model = Converter::new(&ExportSettings::default()).convert_document(&sample_document()).unwrap();
        let weights = &model.vertices[0].weights;
        assert_eq!(weights.len(), 2);
        // bone 1 binds to the shared root, bone 2 to bone 1's tip
        assert_eq!(weights[0].0, 0);
        assert_eq!(weights[1].0, 1);
        assert!((weights[0].1 + weights[1].1 - 1.0).abs() < 1e-6);
    }

    #[test]
    fn extra_influences_are_dropped() {
        let settings = ExportSettings::default();
        let skeleton = build_skeleton(
            (1..=6).map(|id| crate::skeleton::tests::bone(id, 0, [id as f32, 0.0, 0.0], [id as f32, 1.0, 0.0])).collect(),
            &settings,
        )
        .unwrap();
        let host = (1..=6).map(|id| (BoneId(id), id as f32)).collect();
        let (weights, dropped) = Converter::new(&settings).vertex_weights(&skeleton, host);
        assert_eq!(dropped, 2);
        assert_eq!(weights.len(), 4);
        assert_eq!(weights[0].0, skeleton.root_of[&BoneId(6)]);
        let total: f32 = weights.iter().map(|w| w.1).sum();
        assert!((total - 1.0).abs() < 1e-6);
    }

    #[test]
    fn ik_nodes_join_their_effector_group() {
        let model = Converter::new(&ExportSettings::default()).convert_document(&sample_document()).unwrap();
        assert_eq!(model.display_groups.len(), 1);
        let ik_node = model.ik_chains[0].ik_node;
        assert!(model.display_groups[0].nodes.contains(&ik_node));
        // hidden tips and end nodes stay out of the frame lists
        let end = model.ik_chains[0].end_node.unwrap();
        assert!(!model.display_groups[0].nodes.contains(&end));
    }

    #[test]
    fn unrigged_mesh_gets_a_center_node() {
        let mut doc = HostDocument::default();
        doc.scene.objects.push(quad_object("prop", None));
        let model = Converter::new(&ExportSettings::default()).convert_document(&doc).unwrap();
        assert_eq!(model.nodes.len(), 1);
        assert_eq!(model.nodes[0].english_name, "center");
        assert!(model.vertices.iter().all(|vert| vert.weights.is_empty()));
        assert!(model.display_groups.is_empty());
        model.check_bone_references().unwrap();
    }

    #[test]
    fn same_named_targets_list_each_vertex_once() {
        let mut doc = sample_document();
        let mut wide = quad_object("body.wide", None);
        wide.visible = false;
        wide.vertices[2].position = Vec3d::new(1.0, 2.0, 0.0);
        wide.vertices[3].position = Vec3d::new(0.0, 2.0, 0.0);
        doc.scene.objects.push(wide);
        doc.morphs.targets.get_mut(&0).unwrap().push(MorphTargetRef {
            object: 2,
            name: "smile".into(),
            english_name: "smile".into(),
            category: MorphCategory::Lip,
        });

        let model = Converter::new(&ExportSettings::default()).convert_document(&doc).unwrap();
        assert_eq!(model.morphs.targets.len(), 1);
        let mut vertices: Vec<_> = model.morphs.targets[0].offsets.iter().map(|offset| offset.vertex).collect();
        vertices.sort_unstable();
        assert_eq!(vertices, [2, 3]);
        // the first target to move a vertex keeps it
        let moved = model.morphs.targets[0].offsets.iter().find(|offset| offset.vertex == 2).unwrap();
        assert_eq!(moved.delta, Vec3d::new(0.0, 0.5, 0.0));
    }

    /// Hands out one triangle fewer per face once the faces have been counted.
    struct ShrinkingScene {
        scene: crate::Scene,
        calls: std::cell::Cell<usize>,
    }

    impl SceneSource for ShrinkingScene {
        fn objects(&self) -> &[SourceObject] {
            &self.scene.objects
        }
        fn materials(&self) -> &[SourceMaterial] {
            &self.scene.materials
        }
        fn triangulate(&self, object: usize, face: usize) -> Vec<[usize; 3]> {
            self.calls.set(self.calls.get() + 1);
            let mut triangles = crate::fan_triangulate(self.scene.objects[object].faces[face].corners.len());
            if self.calls.get() > 1 {
                triangles.pop();
            }
            triangles
        }
    }

    #[test]
    fn unstable_triangulation_is_caught() {
        let doc = sample_document();
        let scene = ShrinkingScene {
            scene: crate::Scene { objects: vec![quad_object("body", Some(0))], materials: doc.scene.materials.clone() },
            calls: Default::default(),
        };
        let err = Converter::new(&ExportSettings::default()).convert(&scene, &doc.rig, &crate::MorphSet::default()).unwrap_err();
        assert!(matches!(err, ExportError::TriangleCountMismatch { accounted: 2, written: 1 }));
    }
}
