use std::collections::{HashMap, HashSet};

use crate::{MorphCategory, MorphTargetRef, SourceObject, Vec3d};

/// Per-axis tolerance below which a target vertex counts as unmoved.
pub const MORPH_EPSILON: f32 = 1e-5;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MorphOffset {
    /// global welded vertex index
    pub vertex: usize,
    pub delta: Vec3d,
}

#[derive(Debug, Clone)]
pub struct MorphTarget {
    pub name: String,
    pub english_name: String,
    pub category: MorphCategory,
    pub offsets: Vec<MorphOffset>,
}

/// The synthetic base record plus every target, ready for the writers.
#[derive(Debug, Default)]
pub struct Morphs {
    /// absolute positions of every vertex some target moves, each vertex once
    pub base: Vec<MorphOffset>,
    pub targets: Vec<MorphTarget>,
}

impl Morphs {
    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    /// Position of a vertex inside the base record.
    pub fn base_lookup(&self) -> HashMap<usize, usize> {
        self.base.iter().enumerate().map(|(i, entry)| (entry.vertex, i)).collect()
    }

    /// Folds the morphs of another base object into this set. Targets with the
    /// same name are combined into one morph; where both move a vertex, the
    /// offset already in the set wins.
    pub fn merge(&mut self, other: Morphs) {
        let mut in_base: HashSet<usize> = self.base.iter().map(|entry| entry.vertex).collect();
        for entry in other.base {
            if in_base.insert(entry.vertex) {
                self.base.push(entry);
            }
        }
        for target in other.targets {
            let Some(existing) = self.targets.iter_mut().find(|existing| existing.name == target.name) else {
                self.targets.push(target);
                continue;
            };
            let mut moved: HashSet<usize> = existing.offsets.iter().map(|offset| offset.vertex).collect();
            let before = existing.offsets.len() + target.offsets.len();
            existing.offsets.extend(target.offsets.into_iter().filter(|offset| moved.insert(offset.vertex)));
            if existing.offsets.len() < before {
                log::debug!("morph {:?}: {} vertex offset(s) already set by a target of the same name", existing.name, before - existing.offsets.len());
            }
        }
    }
}

/// Compares a base object against each of its targets.
///
/// Target vertices are matched to base vertices by `unique_id`. Every welded
/// vertex that came from a moved source vertex receives the delta, and
/// `vertex_offset` shifts welded indices into the global vertex array.
pub fn diff_morphs(
    base: &SourceObject,
    targets: &[(&MorphTargetRef, &SourceObject)],
    welded_by_original: &[Vec<usize>],
    vertex_offset: usize,
) -> Morphs {
    let mut morphs = Morphs::default();
    let mut base_seen = vec![false; base.vertices.len()];

    for (target_ref, target) in targets {
        let positions: HashMap<u32, Vec3d> = target.vertices.iter().map(|vert| (vert.unique_id, vert.position)).collect();

        let mut offsets = vec![];
        for (original, vert) in base.vertices.iter().enumerate() {
            let Some(&moved) = positions.get(&vert.unique_id) else { continue };
            if !moved.differs_from(vert.position, MORPH_EPSILON) {
                continue;
            }
            let welded = welded_by_original.get(original).map_or(&[][..], |welded| &welded[..]);
            if welded.is_empty() {
                continue;
            }
            for &idx in welded {
                offsets.push(MorphOffset { vertex: vertex_offset + idx, delta: moved - vert.position });
            }
            if !base_seen[original] {
                base_seen[original] = true;
                for &idx in welded {
                    morphs.base.push(MorphOffset { vertex: vertex_offset + idx, delta: vert.position });
                }
            }
        }

        if target.vertices.len() != base.vertices.len() {
            log::debug!(
                "morph {:?}: target has {} vertices, base {:?} has {}",
                target_ref.name,
                target.vertices.len(),
                base.name,
                base.vertices.len()
            );
        }

        morphs.targets.push(MorphTarget {
            name: target_ref.name.clone(),
            english_name: target_ref.english_name.clone(),
            category: target_ref.category.for_target(),
            offsets,
        });
    }

    morphs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SourceVertex;

    fn object(positions: &[[f32; 3]]) -> SourceObject {
        SourceObject {
            name: "face".into(),
            visible: true,
            vertices: positions
                .iter()
                .enumerate()
                .map(|(i, &pos)| SourceVertex { position: pos.into(), unique_id: 100 + i as u32 })
                .collect(),
            faces: vec![],
        }
    }

    fn target(name: &str) -> MorphTargetRef {
        MorphTargetRef { object: 1, name: name.into(), english_name: String::new(), category: MorphCategory::Eye }
    }

    #[test]
    fn only_moved_vertices_get_deltas() {
        let base = object(&[[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [2.0, 0.0, 0.0]]);
        let moved = object(&[[0.0, 0.0, 0.0], [1.0, 0.5, 0.0], [2.0, 0.000001, 0.0]]);
        let welded = vec![vec![0], vec![1], vec![2]];
        let blink = target("blink");
        let morphs = diff_morphs(&base, &[(&blink, &moved)], &welded, 10);

        assert_eq!(morphs.targets.len(), 1);
        assert_eq!(morphs.targets[0].offsets, vec![MorphOffset { vertex: 11, delta: Vec3d::new(0.0, 0.5, 0.0) }]);
        assert_eq!(morphs.targets[0].category, MorphCategory::Eye);
        assert_eq!(morphs.base, vec![MorphOffset { vertex: 11, delta: Vec3d::new(1.0, 0.0, 0.0) }]);
    }

    #[test]
    fn base_record_holds_each_vertex_once() {
        let base = object(&[[0.0, 0.0, 0.0], [1.0, 0.0, 0.0]]);
        let a = object(&[[0.0, 1.0, 0.0], [1.0, 0.0, 0.0]]);
        let b = object(&[[0.0, 2.0, 0.0], [1.0, 1.0, 0.0]]);
        let welded = vec![vec![0], vec![1]];
        let (ra, rb) = (target("a"), target("b"));
        let morphs = diff_morphs(&base, &[(&ra, &a), (&rb, &b)], &welded, 0);

        let base_vertices: Vec<_> = morphs.base.iter().map(|entry| entry.vertex).collect();
        assert_eq!(base_vertices, [0, 1]);
        assert_eq!(morphs.targets[0].offsets.len(), 1);
        assert_eq!(morphs.targets[1].offsets.len(), 2);
    }

    #[test]
    fn split_vertices_all_move() {
        let base = object(&[[0.0, 0.0, 0.0]]);
        let moved = object(&[[0.0, 0.0, 1.0]]);
        // one source vertex welded into two (a UV seam)
        let welded = vec![vec![3, 7]];
        let smile = target("smile");
        let morphs = diff_morphs(&base, &[(&smile, &moved)], &welded, 0);
        let vertices: Vec<_> = morphs.targets[0].offsets.iter().map(|offset| offset.vertex).collect();
        assert_eq!(vertices, [3, 7]);
        assert_eq!(morphs.base.len(), 2);
    }

    #[test]
    fn base_category_is_not_used_by_targets() {
        let base = object(&[[0.0, 0.0, 0.0]]);
        let mut plain = target("plain");
        plain.category = MorphCategory::Base;
        let morphs = diff_morphs(&base, &[(&plain, &base)], &[vec![0]], 0);
        assert_eq!(morphs.targets[0].category, MorphCategory::Other);
        assert!(morphs.targets[0].offsets.is_empty());
        assert!(morphs.base.is_empty());
    }

    #[test]
    fn merging_combines_targets_by_name() {
        let mut first = Morphs {
            base: vec![MorphOffset { vertex: 0, delta: Vec3d::ZERO }],
            targets: vec![MorphTarget {
                name: "smile".into(),
                english_name: String::new(),
                category: MorphCategory::Lip,
                offsets: vec![MorphOffset { vertex: 0, delta: Vec3d::new(0.0, 1.0, 0.0) }],
            }],
        };
        let second = Morphs {
            base: vec![MorphOffset { vertex: 5, delta: Vec3d::ZERO }],
            targets: vec![MorphTarget {
                name: "smile".into(),
                english_name: String::new(),
                category: MorphCategory::Lip,
                offsets: vec![MorphOffset { vertex: 5, delta: Vec3d::new(0.0, 1.0, 0.0) }],
            }],
        };
        first.merge(second);
        assert_eq!(first.targets.len(), 1);
        assert_eq!(first.targets[0].offsets.len(), 2);
        assert_eq!(first.base_lookup()[&5], 1);
    }

    #[test]
    fn merging_never_repeats_a_vertex() {
        let smile = |y: f32| MorphTarget {
            name: "smile".into(),
            english_name: String::new(),
            category: MorphCategory::Lip,
            offsets: vec![MorphOffset { vertex: 2, delta: Vec3d::new(0.0, y, 0.0) }],
        };
        let mut morphs = Morphs::default();
        morphs.merge(Morphs { base: vec![MorphOffset { vertex: 2, delta: Vec3d::ZERO }], targets: vec![smile(0.5), smile(1.0)] });
        morphs.merge(Morphs { base: vec![MorphOffset { vertex: 2, delta: Vec3d::ZERO }], targets: vec![smile(2.0)] });

        assert_eq!(morphs.base.len(), 1);
        assert_eq!(morphs.targets.len(), 1);
        assert_eq!(morphs.targets[0].offsets, vec![MorphOffset { vertex: 2, delta: Vec3d::new(0.0, 0.5, 0.0) }]);
    }
}
