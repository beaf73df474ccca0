use std::collections::HashMap;

use crate::skeleton::{NodeRole, Skeleton, SkeletonNode};
use crate::{BoneId, ExportSettings, Result};

/// Which side of its parent a chain link hangs from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkAttachment {
    ParentTip,
    /// the outermost link of the chain
    ParentRoot,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IkLink {
    pub bone: BoneId,
    /// joint rotated by the solver
    pub node: usize,
    pub attachment: LinkAttachment,
}

#[derive(Debug, Clone)]
pub struct IkChain {
    pub effector: BoneId,
    pub name: String,
    pub ik_node: usize,
    /// joint the solver drags towards the IK node
    pub target: usize,
    pub end_node: Option<usize>,
    /// nearest the effector first
    pub links: Vec<IkLink>,
    /// false when the walk ran out of ancestors before using up the chain length
    pub root_is_chain_tip: bool,
    pub iterations: u16,
    pub control_weight: f32,
}

/// Walks `ik_chain_length + 1` parents up from every effector and appends the
/// IK controller nodes (then the IK end nodes) after every root and tip node.
pub fn resolve_ik_chains(skel: &mut Skeleton, settings: &ExportSettings) -> Result<Vec<IkChain>> {
    let mut chains = vec![];

    // children come after their parents, so walking backwards sees an effector
    // before any of its ancestors can claim a chain of its own
    for i in (0..skel.bones.len()).rev() {
        let effector = &skel.bones[i];
        if effector.ik_chain_length < 0 {
            continue;
        }
        let Some(&target) = skel.root_of.get(&effector.id) else { continue };
        let effector_id = effector.id;
        let name = if effector.ik_name.is_empty() { format!("{}{}", effector.name, settings.ik_suffix) } else { effector.ik_name.clone() };
        let hops = effector.ik_chain_length as usize + 1;

        let mut links = vec![];
        let mut current = effector.parent;
        let mut root_is_chain_tip = true;
        for _ in 0..hops {
            let Some(bone) = skel.bone(current) else {
                root_is_chain_tip = false;
                break;
            };
            let node = skel.root_of[&bone.id];
            links.push(IkLink { bone: bone.id, node, attachment: LinkAttachment::ParentTip });
            current = bone.parent;
        }
        if let Some(last) = links.last_mut() {
            last.attachment = LinkAttachment::ParentRoot;
        }

        for link in &links {
            if let Some(bone) = skel.bone_mut(link.bone) {
                if bone.ik_chain_length >= 0 {
                    log::warn!("bone {:?} is a link of IK chain {:?}; dropping its own chain", bone.name, name);
                    bone.ik_chain_length = -1;
                }
            }
        }

        chains.push(IkChain {
            effector: effector_id,
            name,
            ik_node: 0,
            target,
            end_node: None,
            links,
            root_is_chain_tip,
            iterations: settings.ik_iterations,
            control_weight: settings.ik_control_weight,
        });
    }

    // an effector may have been claimed as a link by a chain walked after it
    chains.retain(|chain| skel.bone(chain.effector).map_or(false, |bone| bone.ik_chain_length >= 0));
    chains.reverse();

    for chain in &mut chains {
        let Some(effector) = skel.bone(chain.effector) else { continue };
        let mut node = SkeletonNode::new(0, None, skel.nodes[chain.target].position, NodeRole::Ik, chain.effector);
        node.name = chain.name.clone();
        node.english_name = if effector.english_name.is_empty() { String::new() } else { format!("{}_IK", effector.english_name) };
        node.movable = true;
        node.group = effector.group;
        chain.ik_node = skel.push_node(node);
    }

    if settings.output_ik_end_nodes {
        for chain in &mut chains {
            let Some(effector) = skel.bone(chain.effector) else { continue };
            let mut node = SkeletonNode::new(0, Some(chain.ik_node), effector.tip, NodeRole::IkEnd, chain.effector);
            node.name = format!("{}{}", chain.name, settings.tip_suffix);
            node.english_name = if effector.english_name.is_empty() { String::new() } else { format!("{}_IK_tip", effector.english_name) };
            node.hidden = true;
            node.group = effector.group;
            let end = skel.push_node(node);
            skel.nodes[chain.ik_node].tail = Some(end);
            chain.end_node = Some(end);
        }
    }

    // parentless root joints that more than one bone hangs from
    let mut bones_at: HashMap<usize, usize> = HashMap::new();
    for &node in skel.root_of.values() {
        if skel.nodes[node].role == NodeRole::Root {
            *bones_at.entry(node).or_default() += 1;
        }
    }

    for chain in &chains {
        for link in &chain.links {
            // an outermost link on a shared root would put unrelated bones under the solver
            if link.attachment == LinkAttachment::ParentRoot && bones_at.get(&link.node).map_or(false, |&n| n > 1) {
                continue;
            }
            let node = &mut skel.nodes[link.node];
            if node.ik_controller.is_none() {
                node.ik_controller = Some(chain.ik_node);
            }
        }
    }

    skel.check_order()?;
    log::debug!("resolved {} IK chain(s)", chains.len());
    Ok(chains)
}
