//! Turns the editor's segment-based rig into the node list the runtime expects.
//!
//! A rig bone runs from a root joint to a tip joint. The target skeleton only
//! knows joints, so every bone is split: parent-less bones get a fresh root
//! node, children hang off their parent's tip node, and each bone gets a tip
//! node of its own unless it is a childless end point.

use std::collections::{HashMap, HashSet};

use crate::{AngleLimits, BoneId, ExportError, ExportSettings, Result, RigBone, Vec3d};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeRole {
    Root,
    Tip,
    Ik,
    IkEnd,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RotationLink {
    pub node: usize,
    /// percent
    pub rate: i32,
}

#[derive(Debug, Clone)]
pub struct SkeletonNode {
    pub index: usize,
    pub parent: Option<usize>,
    pub position: Vec3d,
    pub role: NodeRole,
    /// the bone whose segment this joint rotates; `None` for leaf tips
    pub owner: Option<BoneId>,
    /// the bone that produced the node
    pub source: BoneId,
    pub name: String,
    pub english_name: String,
    pub tail: Option<usize>,
    pub hidden: bool,
    pub movable: bool,
    pub twist: bool,
    pub link: Option<RotationLink>,
    /// IK node driving this joint
    pub ik_controller: Option<usize>,
    pub limits: AngleLimits,
    pub group: u32,
}

impl SkeletonNode {
    pub(crate) fn new(index: usize, parent: Option<usize>, position: Vec3d, role: NodeRole, source: BoneId) -> Self {
        SkeletonNode {
            index,
            parent,
            position,
            role,
            owner: None,
            source,
            name: String::new(),
            english_name: String::new(),
            tail: None,
            hidden: false,
            movable: false,
            twist: false,
            link: None,
            ik_controller: None,
            limits: AngleLimits::default(),
            group: 0,
        }
    }
}

#[derive(Debug, Default)]
pub struct Skeleton {
    pub nodes: Vec<SkeletonNode>,
    /// repaired bones in emission order
    pub bones: Vec<RigBone>,
    pub root_of: HashMap<BoneId, usize>,
    pub tip_of: HashMap<BoneId, usize>,
    pub children: HashMap<BoneId, Vec<BoneId>>,
    /// set when a parent cycle had to be broken by force
    pub cycle_broken: bool,
    bone_index: HashMap<BoneId, usize>,
}

impl Skeleton {
    pub fn bone(&self, id: BoneId) -> Option<&RigBone> {
        self.bone_index.get(&id).map(|&i| &self.bones[i])
    }

    pub(crate) fn bone_mut(&mut self, id: BoneId) -> Option<&mut RigBone> {
        self.bone_index.get(&id).map(|&i| &mut self.bones[i])
    }

    /// The joint a bone's own segment hangs from; vertex weights bind here.
    pub fn node_for_bone(&self, id: BoneId) -> Option<usize> {
        self.root_of.get(&id).copied()
    }

    /// Where children of `id` attach.
    pub fn attach_point(&self, id: BoneId) -> Option<usize> {
        self.tip_of.get(&id).or_else(|| self.root_of.get(&id)).copied()
    }

    pub fn push_node(&mut self, mut node: SkeletonNode) -> usize {
        let index = self.nodes.len();
        node.index = index;
        self.nodes.push(node);
        index
    }

    /// Every parent must come strictly before its child.
    pub fn check_order(&self) -> Result<()> {
        for (i, node) in self.nodes.iter().enumerate() {
            if let Some(parent) = node.parent {
                if parent >= i {
                    return Err(ExportError::NodeOrder { node: i, parent });
                }
            }
        }
        Ok(())
    }
}

/// Clears parent and tip references that point outside the rig. Returns the
/// bones that survived (bones without a usable id are dropped).
fn repair_references(bones: Vec<RigBone>) -> Vec<RigBone> {
    let mut seen = HashSet::new();
    let mut bones: Vec<RigBone> = bones
        .into_iter()
        .filter(|bone| {
            if bone.id.is_none() {
                log::warn!("dropping bone {:?} with reserved id 0", bone.name);
                false
            } else if !seen.insert(bone.id) {
                log::warn!("dropping bone {:?}: duplicate id {:?}", bone.name, bone.id);
                false
            } else {
                true
            }
        })
        .collect();

    let parents: HashMap<BoneId, BoneId> = bones.iter().map(|bone| (bone.id, bone.parent)).collect();
    for bone in &mut bones {
        if !bone.parent.is_none() && (bone.parent == bone.id || !parents.contains_key(&bone.parent)) {
            log::warn!("bone {:?} has missing parent {:?}, treating it as a root", bone.name, bone.parent);
            bone.parent = BoneId::NONE;
        }
    }

    let parents: HashMap<BoneId, BoneId> = bones.iter().map(|bone| (bone.id, bone.parent)).collect();
    for bone in &mut bones {
        if !bone.tip_bone.is_none() && parents.get(&bone.tip_bone) != Some(&bone.id) {
            log::warn!("bone {:?} names {:?} as its tip, which is not one of its children", bone.name, bone.tip_bone);
            bone.tip_bone = BoneId::NONE;
        }
        if !bone.link_target.is_none() && (bone.link_target == bone.id || !parents.contains_key(&bone.link_target)) {
            log::warn!("bone {:?} links to missing bone {:?}", bone.name, bone.link_target);
            bone.link_target = BoneId::NONE;
        }
    }
    bones
}

/// Orders bones so every parent precedes its children, and a parent's
/// designated tip child precedes its siblings. Returns whether a cycle was broken.
fn topological_order(bones: Vec<RigBone>) -> (Vec<RigBone>, bool) {
    let tip_slots: HashMap<BoneId, BoneId> = bones.iter().map(|bone| (bone.id, bone.tip_bone)).collect();
    let mut emitted: HashSet<BoneId> = HashSet::new();
    let mut order = Vec::with_capacity(bones.len());
    let mut remaining = bones;
    let mut cycle_broken = false;

    while !remaining.is_empty() {
        let before = order.len();
        let mut waiting = Vec::with_capacity(remaining.len());
        for bone in remaining {
            let emittable = bone.parent.is_none()
                || (emitted.contains(&bone.parent) && {
                    let slot = tip_slots[&bone.parent];
                    slot.is_none() || slot == bone.id || emitted.contains(&slot)
                });
            if emittable {
                emitted.insert(bone.id);
                order.push(bone);
            } else {
                waiting.push(bone);
            }
        }
        remaining = waiting;

        if order.len() == before {
            log::warn!(
                "bone hierarchy contains a cycle; {} bone(s) are exported as roots: {:?}",
                remaining.len(),
                remaining.iter().map(|bone| &bone.name).collect::<Vec<_>>()
            );
            cycle_broken = true;
            for mut bone in remaining.drain(..) {
                bone.parent = BoneId::NONE;
                emitted.insert(bone.id);
                order.push(bone);
            }
        }
    }

    (order, cycle_broken)
}

pub fn build_skeleton(bones: Vec<RigBone>, settings: &ExportSettings) -> Result<Skeleton> {
    let bones = repair_references(bones);
    let (mut bones, cycle_broken) = topological_order(bones);

    // a force-emitted bone may still be named as a tip by its former parent
    let parents: HashMap<BoneId, BoneId> = bones.iter().map(|bone| (bone.id, bone.parent)).collect();
    for bone in &mut bones {
        if !bone.tip_bone.is_none() && parents.get(&bone.tip_bone) != Some(&bone.id) {
            bone.tip_bone = BoneId::NONE;
        }
    }

    let mut skel = Skeleton {
        cycle_broken,
        bone_index: bones.iter().enumerate().map(|(i, bone)| (bone.id, i)).collect(),
        ..Default::default()
    };
    for bone in &bones {
        skel.children.entry(bone.id).or_default();
        if !bone.parent.is_none() {
            skel.children.entry(bone.parent).or_default().push(bone.id);
        }
    }
    skel.bones = bones;

    // root/tip split
    let mut roots_at: HashMap<Vec3d, usize> = HashMap::new();
    for i in 0..skel.bones.len() {
        let bone = &skel.bones[i];
        let (id, parent) = (bone.id, bone.parent);
        let (root_pos, tip_pos) = (bone.root, bone.tip);

        let root = if parent.is_none() {
            match roots_at.get(&root_pos) {
                Some(&shared) => shared,
                None => {
                    let node = skel.push_node(SkeletonNode::new(0, None, root_pos, NodeRole::Root, id));
                    skel.nodes[node].owner = Some(id);
                    roots_at.insert(root_pos, node);
                    node
                }
            }
        } else {
            // parents are emitted first, so the attach point already exists
            skel.attach_point(parent).ok_or(ExportError::NodeOrder { node: skel.nodes.len(), parent: skel.nodes.len() })?
        };
        skel.root_of.insert(id, root);

        let childless = skel.children[&id].is_empty();
        if !(childless && skel.bones[i].is_end_point) {
            let tip = skel.push_node(SkeletonNode::new(0, Some(root), tip_pos, NodeRole::Tip, id));
            let owner = tip_child(&skel, &skel.bones[i]);
            skel.nodes[tip].owner = owner;
            skel.tip_of.insert(id, tip);
        }
    }

    name_nodes(&mut skel, settings);
    propagate_twist(&mut skel);

    skel.check_order()?;

    log::debug!(
        "built skeleton: {} bones -> {} nodes{}",
        skel.bones.len(),
        skel.nodes.len(),
        if skel.cycle_broken { " (cycle broken)" } else { "" }
    );

    Ok(skel)
}

/// The child whose joint sits on this bone's tip.
fn tip_child(skel: &Skeleton, bone: &RigBone) -> Option<BoneId> {
    if !bone.tip_bone.is_none() {
        return Some(bone.tip_bone);
    }
    match &*skel.children[&bone.id] {
        [only] => Some(*only),
        [first, ..] => Some(*first),
        [] => None,
    }
}

/// Copies names, flags and tails from each node's owning bone.
fn name_nodes(skel: &mut Skeleton, settings: &ExportSettings) {
    for i in 0..skel.nodes.len() {
        let node = &skel.nodes[i];
        let (owner, source) = (node.owner, node.source);
        let tail = owner.and_then(|owner| skel.tip_of.get(&owner).copied());

        let mut named = node.clone();
        named.tail = tail;
        match owner.and_then(|owner| skel.bone(owner)) {
            Some(bone) => {
                named.name = bone.name.clone();
                named.english_name = bone.english_name.clone();
                named.hidden = bone.is_dummy;
                named.movable = bone.is_movable;
                named.limits = bone.limits;
                named.group = bone.group;
                if !bone.link_target.is_none() {
                    named.link = skel.root_of.get(&bone.link_target).map(|&node| RotationLink { node, rate: bone.link_rotate_rate });
                }
            }
            None => {
                let Some(bone) = skel.bone(source) else { continue };
                named.name = format!("{}{}", bone.name, settings.tip_suffix);
                named.english_name = if bone.english_name.is_empty() { String::new() } else { format!("{}_tip", bone.english_name) };
                named.hidden = true;
                named.group = bone.group;
            }
        }
        skel.nodes[i] = named;
    }
}

/// Twist is a property of the joint: a bone limited to twisting marks the
/// joint it hangs from, which is its parent's tip.
fn propagate_twist(skel: &mut Skeleton) {
    let mut joint_twist: HashSet<BoneId> = HashSet::new();
    for bone in &skel.bones {
        if bone.limits.is_twist() && !bone.parent.is_none() {
            joint_twist.insert(bone.parent);
        }
    }
    for id in joint_twist {
        if let Some(&tip) = skel.tip_of.get(&id) {
            skel.nodes[tip].twist = true;
        }
    }
}
