//! Vertex welding: collapses face corners that share a source vertex (and,
//! depending on [`SeparationFlags`], the same normal, UV and color) into one
//! output vertex.

use std::collections::HashMap;

use crate::{ExportError, Result, SeparationFlags, SourceObject, Vec2d, Vec3d};

#[derive(Debug, Clone, PartialEq)]
pub struct WeldedVertex {
    /// index into the source object's vertex list
    pub original: usize,
    pub normal: Vec3d,
    pub uv: Vec2d,
    pub color: u32,
}

#[derive(Debug, Default)]
pub struct WeldedMesh {
    pub vertices: Vec<WeldedVertex>,
    /// for every face, the welded vertex of each corner
    pub faces: Vec<Vec<usize>>,
    /// for every welded vertex, the faces it came from
    pub vertex_faces: Vec<Vec<usize>>,
}

impl WeldedMesh {
    /// Welded vertices grouped by the original vertex they came from.
    pub fn by_original(&self, original_count: usize) -> Vec<Vec<usize>> {
        let mut out = vec![vec![]; original_count];
        for (i, vert) in self.vertices.iter().enumerate() {
            out[vert.original].push(i);
        }
        out
    }

    pub fn len(&self) -> usize {
        self.vertices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vertices.is_empty()
    }
}

// attributes that are not separated are left as None so they never split a vertex
#[derive(PartialEq, Eq, Hash)]
struct WeldKey {
    original: usize,
    normal: Option<Vec3d>,
    uv: Option<Vec2d>,
    color: Option<u32>,
}

impl WeldKey {
    // -0.0 and 0.0 are the same attribute value
    fn normal(normal: Vec3d) -> Vec3d {
        Vec3d::new(normal.x + 0.0, normal.y + 0.0, normal.z + 0.0)
    }

    fn uv(uv: Vec2d) -> Vec2d {
        Vec2d::new(uv.u + 0.0, uv.v + 0.0)
    }
}

fn oom(what: &'static str, count: usize) -> impl FnOnce(std::collections::TryReserveError) -> ExportError {
    move |_| ExportError::OutOfMemory { what, count }
}

pub fn weld(object: &SourceObject, separate: SeparationFlags) -> Result<WeldedMesh> {
    let corner_count = object.corner_count();

    let mut welded = WeldedMesh::default();
    welded.vertices.try_reserve(corner_count).map_err(oom("welded vertices", corner_count))?;
    welded.vertex_faces.try_reserve(corner_count).map_err(oom("welded vertex faces", corner_count))?;
    welded.faces.try_reserve(object.faces.len()).map_err(oom("welded faces", object.faces.len()))?;

    let mut lookup: HashMap<WeldKey, usize> = HashMap::new();
    let table_size = corner_count + object.vertices.len();
    lookup.try_reserve(table_size).map_err(oom("weld table", table_size))?;

    for (face_idx, face) in object.faces.iter().enumerate() {
        let mut face_out = Vec::with_capacity(face.corners.len());
        for corner in &face.corners {
            if corner.vertex >= object.vertices.len() {
                return Err(ExportError::Source(format!(
                    "object {:?} face {} references vertex {} of {}",
                    object.name,
                    face_idx,
                    corner.vertex,
                    object.vertices.len()
                )));
            }

            let key = WeldKey {
                original: corner.vertex,
                normal: separate.normals.then(|| WeldKey::normal(corner.normal)),
                uv: separate.uvs.then(|| WeldKey::uv(corner.uv)),
                color: separate.colors.then_some(corner.color),
            };

            let idx = match lookup.get(&key) {
                Some(&idx) => {
                    if !separate.normals {
                        welded.vertices[idx].normal += corner.normal;
                    }
                    idx
                }
                None => {
                    let idx = welded.vertices.len();
                    welded.vertices.push(WeldedVertex {
                        original: corner.vertex,
                        normal: corner.normal,
                        uv: corner.uv,
                        color: corner.color,
                    });
                    welded.vertex_faces.push(vec![]);
                    lookup.insert(key, idx);
                    idx
                }
            };

            if welded.vertex_faces[idx].last() != Some(&face_idx) {
                welded.vertex_faces[idx].push(face_idx);
            }
            face_out.push(idx);
        }
        welded.faces.push(face_out);
    }

    if !separate.normals {
        for vert in &mut welded.vertices {
            vert.normal = vert.normal.normalize();
        }
    }

    log::debug!(
        "welded {:?}: {} corners, {} source vertices -> {} vertices",
        object.name,
        corner_count,
        object.vertices.len(),
        welded.vertices.len()
    );

    Ok(welded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{SourceCorner, SourceFace, SourceVertex};

    fn corner(vertex: usize, normal: [f32; 3], uv: [f32; 2]) -> SourceCorner {
        SourceCorner { vertex, normal: normal.into(), uv: uv.into(), color: 0xFFFF_FFFF }
    }

    // two triangles sharing the 1-2 edge
    fn quad(second_normal: [f32; 3]) -> SourceObject {
        let up = [0.0, 0.0, 1.0];
        SourceObject {
            name: "quad".into(),
            visible: true,
            vertices: (0..4).map(|i| SourceVertex { position: Vec3d::new(i as f32, 0.0, 0.0), unique_id: i }).collect(),
            faces: vec![
                SourceFace {
                    material: None,
                    corners: vec![corner(0, up, [0.0, 0.0]), corner(1, up, [1.0, 0.0]), corner(2, up, [0.0, 1.0])],
                },
                SourceFace {
                    material: None,
                    corners: vec![
                        corner(2, second_normal, [0.0, 1.0]),
                        corner(1, second_normal, [1.0, 0.0]),
                        corner(3, second_normal, [1.0, 1.0]),
                    ],
                },
            ],
        }
    }

    #[test]
    fn shared_edge_welds_to_four_vertices() {
        let flags = SeparationFlags { normals: true, uvs: true, colors: true };
        let welded = weld(&quad([0.0, 0.0, 1.0]), flags).unwrap();
        assert_eq!(welded.len(), 4);
        assert_eq!(welded.faces, vec![vec![0, 1, 2], vec![2, 1, 3]]);
        assert_eq!(welded.vertex_faces[1], vec![0, 1]);
        assert_eq!(welded.vertex_faces[0], vec![0]);
    }

    #[test]
    fn separated_normals_split_the_shared_edge() {
        let flags = SeparationFlags { normals: true, uvs: false, colors: false };
        let welded = weld(&quad([0.0, 1.0, 0.0]), flags).unwrap();
        assert_eq!(welded.len(), 6);
    }

    #[test]
    fn signed_zeros_do_not_split_corners() {
        let flags = SeparationFlags { normals: true, uvs: true, colors: true };
        let mut object = quad([0.0, -0.0, 1.0]);
        object.faces[1].corners[0].uv = [-0.0, 1.0].into();
        let welded = weld(&object, flags).unwrap();
        assert_eq!(welded.len(), 4);
        assert_eq!(welded.faces, vec![vec![0, 1, 2], vec![2, 1, 3]]);
    }

    #[test]
    fn merged_normals_are_averaged() {
        let flags = SeparationFlags { normals: false, uvs: false, colors: false };
        let welded = weld(&quad([0.0, 1.0, 0.0]), flags).unwrap();
        assert_eq!(welded.len(), 4);
        let shared = welded.vertices[1].normal;
        let expected = Vec3d::new(0.0, 1.0, 1.0).normalize();
        assert!(!shared.differs_from(expected, 1e-6));
        // unshared vertices keep a unit normal
        assert!((welded.vertices[0].normal.magnitude() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn welding_is_deterministic() {
        let flags = SeparationFlags::default();
        let object = quad([0.0, 1.0, 0.0]);
        let a = weld(&object, flags).unwrap();
        let b = weld(&object, flags).unwrap();
        assert_eq!(a.vertices, b.vertices);
        assert_eq!(a.faces, b.faces);
    }

    #[test]
    fn welded_count_is_bounded() {
        for flags in [
            SeparationFlags { normals: false, uvs: false, colors: false },
            SeparationFlags { normals: true, uvs: true, colors: true },
        ] {
            let object = quad([1.0, 0.0, 0.0]);
            let welded = weld(&object, flags).unwrap();
            assert!(welded.len() >= object.vertices.len());
            assert!(welded.len() <= object.corner_count());
        }
    }

    #[test]
    fn unreferenced_vertices_contribute_nothing() {
        let mut object = quad([0.0, 0.0, 1.0]);
        object.vertices.push(SourceVertex { position: Vec3d::ZERO, unique_id: 99 });
        let welded = weld(&object, SeparationFlags::default()).unwrap();
        assert_eq!(welded.len(), 4);
        assert!(welded.by_original(object.vertices.len())[4].is_empty());
    }

    #[test]
    fn dangling_corner_is_an_error() {
        let mut object = quad([0.0, 0.0, 1.0]);
        object.faces[0].corners[0].vertex = 17;
        assert!(matches!(weld(&object, SeparationFlags::default()), Err(ExportError::Source(_))));
    }
}
