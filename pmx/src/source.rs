//! Read-only views of the host editor: scene geometry, the bone rig, and
//! morph target bookkeeping. The exporter only ever sees these traits; the
//! in-memory types below are what importers and tests fill in.

use std::collections::{BTreeMap, HashMap};

use crate::{AngleLimits, BoneId, MorphCategory, Vec2d, Vec3d};

#[derive(Debug, Clone, Default)]
pub struct SourceVertex {
    pub position: Vec3d,
    /// stable across object instances; correlates weights and morph targets
    pub unique_id: u32,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SourceCorner {
    /// index into the owning object's vertex list
    pub vertex: usize,
    pub normal: Vec3d,
    pub uv: Vec2d,
    /// RGBA8, red in the low byte
    pub color: u32,
}

#[derive(Debug, Clone, Default)]
pub struct SourceFace {
    pub material: Option<usize>,
    pub corners: Vec<SourceCorner>,
}

#[derive(Debug, Clone, Default)]
pub struct SourceObject {
    pub name: String,
    pub visible: bool,
    pub vertices: Vec<SourceVertex>,
    pub faces: Vec<SourceFace>,
}
impl SourceObject {
    pub fn corner_count(&self) -> usize {
        self.faces.iter().map(|face| face.corners.len()).sum()
    }
}

#[derive(Debug, Clone)]
pub struct SourceMaterial {
    pub name: String,
    pub english_name: String,
    pub diffuse: [f32; 4],
    pub specular: [f32; 3],
    pub specular_power: f32,
    pub ambient: [f32; 3],
    pub texture: Option<String>,
    pub sphere_texture: Option<String>,
    /// 1 multiply, 2 add
    pub sphere_mode: u8,
    /// shared toon slot 0..10
    pub toon: Option<u8>,
    pub edge: bool,
    pub double_sided: bool,
}
impl Default for SourceMaterial {
    fn default() -> Self {
        SourceMaterial {
            name: String::new(),
            english_name: String::new(),
            diffuse: [0.8, 0.8, 0.8, 1.0],
            specular: [0.0; 3],
            specular_power: 5.0,
            ambient: [0.4, 0.4, 0.4],
            texture: None,
            sphere_texture: None,
            sphere_mode: 1,
            toon: None,
            edge: true,
            double_sided: false,
        }
    }
}

/// One editor-side bone segment, from its root joint to its tip.
#[derive(Debug, Clone)]
pub struct RigBone {
    pub id: BoneId,
    pub parent: BoneId,
    pub name: String,
    pub english_name: String,
    pub root: Vec3d,
    pub tip: Vec3d,
    /// -1 when the bone is not an IK effector
    pub ik_chain_length: i32,
    /// name of the synthesized IK controller, derived from the bone name when empty
    pub ik_name: String,
    pub is_dummy: bool,
    pub is_end_point: bool,
    pub is_movable: bool,
    pub link_target: BoneId,
    /// percent of the link target's rotation inherited
    pub link_rotate_rate: i32,
    pub group: u32,
    pub limits: AngleLimits,
    /// child whose joint the tip connects to, `BoneId::NONE` for a synthetic tip
    pub tip_bone: BoneId,
}
impl Default for RigBone {
    fn default() -> Self {
        RigBone {
            id: BoneId::NONE,
            parent: BoneId::NONE,
            name: String::new(),
            english_name: String::new(),
            root: Vec3d::ZERO,
            tip: Vec3d::ZERO,
            ik_chain_length: -1,
            ik_name: String::new(),
            is_dummy: false,
            is_end_point: false,
            is_movable: false,
            link_target: BoneId::NONE,
            link_rotate_rate: 100,
            group: 0,
            limits: AngleLimits::default(),
            tip_bone: BoneId::NONE,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RigGroup {
    pub id: u32,
    pub name: String,
    pub english_name: String,
}

#[derive(Debug, Clone, Default)]
pub struct MorphTargetRef {
    /// object holding the target pose
    pub object: usize,
    pub name: String,
    pub english_name: String,
    pub category: MorphCategory,
}

pub trait SceneSource {
    fn objects(&self) -> &[SourceObject];
    fn materials(&self) -> &[SourceMaterial];

    /// Splits a polygon into triangles, as corner indices within the face.
    fn triangulate(&self, object: usize, face: usize) -> Vec<[usize; 3]> {
        fan_triangulate(self.objects()[object].faces[face].corners.len())
    }
}

pub trait RigSource {
    fn bones(&self) -> Vec<RigBone>;
    fn groups(&self) -> Vec<RigGroup>;
    fn vertex_weights(&self, object: usize, unique_id: u32) -> Vec<(BoneId, f32)>;
}

pub trait MorphSource {
    fn base_objects(&self) -> Vec<usize>;
    fn targets(&self, base: usize) -> Vec<MorphTargetRef>;
}

pub fn fan_triangulate(corner_count: usize) -> Vec<[usize; 3]> {
    (1..corner_count.saturating_sub(1)).map(|i| [0, i, i + 1]).collect()
}

#[derive(Debug, Default)]
pub struct Scene {
    pub objects: Vec<SourceObject>,
    pub materials: Vec<SourceMaterial>,
}
impl SceneSource for Scene {
    fn objects(&self) -> &[SourceObject] {
        &self.objects
    }
    fn materials(&self) -> &[SourceMaterial] {
        &self.materials
    }
}

#[derive(Debug, Default)]
pub struct Rig {
    pub bones: Vec<RigBone>,
    pub groups: Vec<RigGroup>,
    pub weights: HashMap<(usize, u32), Vec<(BoneId, f32)>>,
}
impl RigSource for Rig {
    fn bones(&self) -> Vec<RigBone> {
        self.bones.clone()
    }
    fn groups(&self) -> Vec<RigGroup> {
        self.groups.clone()
    }
    fn vertex_weights(&self, object: usize, unique_id: u32) -> Vec<(BoneId, f32)> {
        self.weights.get(&(object, unique_id)).cloned().unwrap_or_default()
    }
}

#[derive(Debug, Default)]
pub struct MorphSet {
    pub targets: BTreeMap<usize, Vec<MorphTargetRef>>,
}
impl MorphSource for MorphSet {
    fn base_objects(&self) -> Vec<usize> {
        self.targets.keys().copied().collect()
    }
    fn targets(&self, base: usize) -> Vec<MorphTargetRef> {
        self.targets.get(&base).cloned().unwrap_or_default()
    }
}

/// A complete host document: what an importer hands to the exporter.
#[derive(Debug, Default)]
pub struct HostDocument {
    pub scene: Scene,
    pub rig: Rig,
    pub morphs: MorphSet,
}
