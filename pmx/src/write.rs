use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use byteorder::{WriteBytesExt, LE};
use encoding_rs::SHIFT_JIS;
use nalgebra_glm::Mat4;
extern crate nalgebra_glm as glm;

use crate::convert::ExportModel;
use crate::{AngleLimits, ExportError, ExportSettings, Format, Result, Vec3d};

pub(crate) trait Serialize {
    fn write_to(&self, w: &mut impl Write) -> io::Result<()>;
}

impl<T: Serialize, const N: usize> Serialize for [T; N] {
    fn write_to(&self, w: &mut impl Write) -> io::Result<()> {
        for item in self {
            item.write_to(w)?;
        }
        Ok(())
    }
}

impl Serialize for u32 {
    fn write_to(&self, w: &mut impl Write) -> io::Result<()> {
        w.write_u32::<LE>(*self)
    }
}
impl Serialize for u16 {
    fn write_to(&self, w: &mut impl Write) -> io::Result<()> {
        w.write_u16::<LE>(*self)
    }
}
impl Serialize for u8 {
    fn write_to(&self, w: &mut impl Write) -> io::Result<()> {
        w.write_u8(*self)
    }
}
impl Serialize for f32 {
    fn write_to(&self, w: &mut impl Write) -> io::Result<()> {
        w.write_f32::<LE>(*self)
    }
}
impl Serialize for i32 {
    fn write_to(&self, w: &mut impl Write) -> io::Result<()> {
        w.write_i32::<LE>(*self)
    }
}

/// The reflected, scaled output space. The runtime is left handed, so z is mirrored.
#[derive(Clone, Copy)]
pub(crate) struct Space {
    matrix: Mat4,
}
impl Space {
    pub fn new(scale: f32) -> Self {
        Space { matrix: glm::scaling(&glm::vec3(scale, scale, -scale)) }
    }

    pub fn point(&self, vec: Vec3d) -> Vec3d {
        &self.matrix * vec
    }

    /// Directions are reflected but keep their length.
    pub fn direction(&self, vec: Vec3d) -> Vec3d {
        Vec3d::new(vec.x, vec.y, -vec.z)
    }

    /// Converts degree limits to reflected radians. Mirroring z flips the
    /// sense of rotation about x and y.
    pub fn angle_limits(&self, limits: &AngleLimits) -> (Vec3d, Vec3d) {
        let (min, max) = (limits.min, limits.max);
        let min_out = Vec3d::new(-max.x, -max.y, min.z);
        let max_out = Vec3d::new(-min.x, -min.y, max.z);
        let rad = |v: Vec3d| Vec3d::new(v.x.to_radians(), v.y.to_radians(), v.z.to_radians());
        (rad(min_out), rad(max_out))
    }
}

/// Round half up to two decimals.
pub fn quantize_weight(weight: f32) -> f32 {
    ((weight * 100.0) + 0.5).floor() / 100.0
}

/// Quantizes every weight but the last, which takes the remainder so the set
/// still sums to one.
pub fn quantize_weights(weights: &[f32]) -> Vec<f32> {
    let Some((_, leading)) = weights.split_last() else { return vec![] };
    let mut out: Vec<f32> = leading.iter().map(|&w| quantize_weight(w)).collect();
    let used: f32 = out.iter().sum();
    out.push((1.0 - used).max(0.0));
    out
}

/// Shift-JIS bytes of `text`, cut before the first character that would not fit in `budget`.
pub(crate) fn encode_sjis(text: &str, budget: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(budget);
    let mut buf = [0; 4];
    for ch in text.chars() {
        let (bytes, _, unmappable) = SHIFT_JIS.encode(ch.encode_utf8(&mut buf));
        let bytes: &[u8] = if unmappable { b"?" } else { &bytes };
        if out.len() + bytes.len() > budget {
            break;
        }
        out.extend_from_slice(bytes);
    }
    out
}

/// A null padded, fixed width Shift-JIS field.
pub(crate) fn write_fixed_str(w: &mut impl Write, text: &str, width: usize) -> io::Result<()> {
    let bytes = encode_sjis(text, width);
    w.write_all(&bytes)?;
    w.write_all(&vec![0; width - bytes.len()])
}

/// i32 byte length followed by UTF-16LE code units.
pub(crate) fn write_utf16(w: &mut impl Write, text: &str) -> io::Result<()> {
    let units: Vec<u16> = text.encode_utf16().collect();
    w.write_i32::<LE>((units.len() * 2) as i32)?;
    for unit in units {
        w.write_u16::<LE>(unit)?;
    }
    Ok(())
}

/// Width of an index field in the extended layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum IndexSize {
    One = 1,
    Two = 2,
    Four = 4,
}
impl IndexSize {
    /// Vertex indices are unsigned.
    pub fn for_vertices(count: usize) -> Self {
        if count < 0x100 {
            IndexSize::One
        } else if count < 0x10000 {
            IndexSize::Two
        } else {
            IndexSize::Four
        }
    }

    /// Every other index is signed, with -1 meaning none.
    pub fn for_count(count: usize) -> Self {
        if count < 0x80 {
            IndexSize::One
        } else if count < 0x8000 {
            IndexSize::Two
        } else {
            IndexSize::Four
        }
    }

    pub fn write_vertex(self, w: &mut impl Write, index: usize) -> io::Result<()> {
        match self {
            IndexSize::One => w.write_u8(index as u8),
            IndexSize::Two => w.write_u16::<LE>(index as u16),
            IndexSize::Four => w.write_u32::<LE>(index as u32),
        }
    }

    pub fn write(self, w: &mut impl Write, index: Option<usize>) -> io::Result<()> {
        let index = index.map_or(-1, |i| i as i64);
        match self {
            IndexSize::One => w.write_i8(index as i8),
            IndexSize::Two => w.write_i16::<LE>(index as i16),
            IndexSize::Four => w.write_i32::<LE>(index as i32),
        }
    }
}

/// Runs `f`, which returns how many records it wrote, and checks that against
/// the count already declared in the stream.
pub(crate) fn write_section<W: Write>(w: &mut W, section: &'static str, declared: usize, f: impl FnOnce(&mut W) -> Result<usize>) -> Result<()> {
    let written = f(w)?;
    if written != declared {
        return Err(ExportError::SectionCount { section, declared, written });
    }
    Ok(())
}

impl ExportModel {
    /// Every vertex must bind to a node that is written; an unbound vertex binds to node 0.
    pub(crate) fn check_bone_references(&self) -> Result<()> {
        let bones = self.nodes.len();
        for (vertex, vert) in self.vertices.iter().enumerate() {
            let dangling = match vert.weights.iter().map(|&(node, _)| node).find(|&node| node >= bones) {
                Some(node) => Some(node),
                None if vert.weights.is_empty() && bones == 0 => Some(0),
                None => None,
            };
            if let Some(bone) = dangling {
                return Err(ExportError::DanglingBone { vertex, bone, bones });
            }
        }
        Ok(())
    }

    pub fn write(&self, w: &mut impl Write, settings: &ExportSettings) -> Result<()> {
        self.check_bone_references()?;
        match settings.format {
            Format::Pmd => crate::write_pmd::write_pmd(self, w, settings),
            Format::Pmx => crate::write_pmx::write_pmx(self, w, settings),
        }
    }
}

fn temp_sibling(path: &Path) -> PathBuf {
    let mut name = std::ffi::OsString::from(".");
    name.push(path.file_name().unwrap_or_default());
    name.push(".partial");
    path.with_file_name(name)
}

fn write_file(model: &ExportModel, path: &Path, settings: &ExportSettings) -> Result<()> {
    let mut w = BufWriter::new(File::create(path)?);
    model.write(&mut w, settings)?;
    let file = w.into_inner().map_err(|err| ExportError::Io(err.into_error()))?;
    file.sync_all()?;
    Ok(())
}

/// Writes the model next to `path` and moves it into place only once the whole
/// stream made it to disk; a failed export leaves nothing behind.
pub fn export_to_path(model: &ExportModel, path: impl AsRef<Path>, settings: &ExportSettings) -> Result<()> {
    let path = path.as_ref();
    let temp = temp_sibling(path);

    match write_file(model, &temp, settings) {
        Ok(()) => {
            fs::rename(&temp, path)?;
            log::info!("wrote {} ({})", path.display(), settings.format);
            Ok(())
        }
        Err(err) => {
            if let Err(cleanup) = fs::remove_file(&temp) {
                if cleanup.kind() != io::ErrorKind::NotFound {
                    log::warn!("could not remove {}: {}", temp.display(), cleanup);
                }
            }
            Err(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn weights_round_half_up() {
        assert_eq!(quantize_weight(0.667), 0.67);
        assert_eq!(quantize_weight(0.125), 0.13);
        assert_eq!(quantize_weight(0.0), 0.0);
        assert_eq!(quantize_weight(1.0), 1.0);
    }

    #[test]
    fn two_bone_weights_sum_to_one() {
        let q = quantize_weights(&[0.667, 0.333]);
        assert_eq!(q[0], 0.67);
        assert!((q[1] - 0.33).abs() < 1e-6);
        assert!((q.iter().sum::<f32>() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn four_bone_weights_use_the_same_rule() {
        let q = quantize_weights(&[0.4, 0.3, 0.2, 0.1]);
        assert_eq!(q.len(), 4);
        assert!((q[3] - 0.1).abs() < 1e-5);
        let q = quantize_weights(&[0.5, 0.25, 0.25]);
        assert_eq!(q.len(), 3);
        assert!((q[2] - 0.24).abs() < 1e-5 || (q[2] - 0.25).abs() < 1e-5);
        assert!(quantize_weights(&[]).is_empty());
    }

    #[test]
    fn space_mirrors_z_and_scales() {
        let space = Space::new(2.0);
        assert_eq!(space.point(Vec3d::new(1.0, 2.0, 3.0)), Vec3d::new(2.0, 4.0, -6.0));
        assert_eq!(space.direction(Vec3d::new(0.0, 0.0, 1.0)), Vec3d::new(0.0, 0.0, -1.0));
    }

    #[test]
    fn angle_limits_are_reflected_radians() {
        let limits = AngleLimits { min: Vec3d::new(-10.0, 0.0, -90.0), max: Vec3d::new(45.0, 0.0, 90.0) };
        let (min, max) = Space::new(1.0).angle_limits(&limits);
        assert!((min.x - (-45f32).to_radians()).abs() < 1e-6);
        assert!((max.x - 10f32.to_radians()).abs() < 1e-6);
        assert!((min.z - (-90f32).to_radians()).abs() < 1e-6);
    }

    #[test]
    fn sjis_truncates_on_whole_characters() {
        // each kana is two bytes in Shift-JIS
        let bytes = encode_sjis("あいう", 5);
        assert_eq!(bytes.len(), 4);
        assert_eq!(encode_sjis("abc", 20), b"abc");

        let mut buf = vec![];
        write_fixed_str(&mut buf, "センター", 7).unwrap();
        assert_eq!(buf.len(), 7);
        assert_eq!(buf[6], 0);
    }

    #[test]
    fn utf16_strings_are_length_prefixed() {
        let mut buf = vec![];
        write_utf16(&mut buf, "先").unwrap();
        assert_eq!(buf, [2, 0, 0, 0, 0x48, 0x51]);
    }

    #[test]
    fn index_sizes_follow_counts() {
        assert_eq!(IndexSize::for_vertices(255), IndexSize::One);
        assert_eq!(IndexSize::for_vertices(256), IndexSize::Two);
        assert_eq!(IndexSize::for_vertices(70000), IndexSize::Four);
        assert_eq!(IndexSize::for_count(127), IndexSize::One);
        assert_eq!(IndexSize::for_count(128), IndexSize::Two);
        assert_eq!(IndexSize::for_count(40000), IndexSize::Four);

        let mut buf = vec![];
        IndexSize::Two.write(&mut buf, None).unwrap();
        assert_eq!(buf, [0xFF, 0xFF]);
    }

    #[test]
    fn section_count_mismatch_is_an_error() {
        let mut buf: Vec<u8> = vec![];
        let err = write_section(&mut buf, "vertex", 3, |_| Ok(2)).unwrap_err();
        assert!(matches!(err, ExportError::SectionCount { section: "vertex", declared: 3, written: 2 }));
    }

    #[test]
    fn unbound_vertices_need_a_node() {
        let vertex = crate::ExportVertex {
            position: Vec3d::ZERO,
            normal: Vec3d::new(0.0, 1.0, 0.0),
            uv: crate::Vec2d::new(0.0, 0.0),
            color: u32::MAX,
            weights: vec![],
            edge: false,
        };
        let model = ExportModel { vertices: vec![vertex], ..Default::default() };
        for format in [Format::Pmd, Format::Pmx] {
            let settings = ExportSettings { format, ..Default::default() };
            let mut buf = vec![];
            let err = model.write(&mut buf, &settings).unwrap_err();
            assert!(matches!(err, ExportError::DanglingBone { vertex: 0, bone: 0, bones: 0 }));
            assert!(buf.is_empty());
        }
    }

    #[test]
    fn weights_must_name_written_nodes() {
        let mut model = crate::convert::tests::converted_sample();
        model.vertices[1].weights = vec![(model.nodes.len(), 1.0)];
        let err = model.check_bone_references().unwrap_err();
        assert!(matches!(err, ExportError::DanglingBone { vertex: 1, .. }));
    }

    #[test]
    fn temp_file_sits_next_to_the_target() {
        let temp = temp_sibling(Path::new("/tmp/out/model.pmx"));
        assert_eq!(temp, Path::new("/tmp/out/.model.pmx.partial"));
    }
}
