use std::fmt::Display;
use std::io::{self, ErrorKind, Read};

use encoding_rs::{SHIFT_JIS, UTF_16LE};

use crate::{bone_flags, ExportError, Format, Result};

/// Section counts and names read back from a model file.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModelSummary {
    pub format: Format,
    pub version: f32,
    pub name: String,
    pub english_name: String,
    pub comment: String,
    pub vertex_count: usize,
    pub index_count: usize,
    pub texture_count: usize,
    pub material_count: usize,
    pub bone_count: usize,
    pub ik_count: usize,
    pub morph_count: usize,
    pub display_frame_count: usize,
    pub rigid_body_count: usize,
    pub joint_count: usize,
    pub bone_names: Vec<String>,
    pub morph_names: Vec<String>,
}

impl Display for ModelSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "{} {:.1} {:?} ({:?})", self.format, self.version, self.name, self.english_name)?;
        writeln!(f, "  vertices:       {}", self.vertex_count)?;
        writeln!(f, "  triangles:      {}", self.index_count / 3)?;
        writeln!(f, "  textures:       {}", self.texture_count)?;
        writeln!(f, "  materials:      {}", self.material_count)?;
        writeln!(f, "  bones:          {} ({} IK)", self.bone_count, self.ik_count)?;
        writeln!(f, "  morphs:         {}", self.morph_count)?;
        writeln!(f, "  display frames: {}", self.display_frame_count)?;
        write!(f, "  physics:        {} rigid bodies, {} joints", self.rigid_body_count, self.joint_count)
    }
}

struct PmxGlobals {
    utf8: bool,
    extra_uvs: u64,
    vertex: u64,
    texture: u64,
    material: u64,
    bone: u64,
    morph: u64,
    rigid: u64,
}

pub struct Parser<R> {
    file: R,
    format: Format,
}

impl<R: Read> Parser<R> {
    pub fn new(mut file: R) -> Result<Parser<R>> {
        let magic: [u8; 3] = read_bytes(&mut file).map_err(truncated)?;
        let format = if &magic == Format::PMD_MAGIC {
            Format::Pmd
        } else if magic == Format::PMX_MAGIC[..3] && read_bytes::<1>(&mut file).map_err(truncated)? == [b' '] {
            Format::Pmx
        } else {
            return Err(ExportError::Format("not a PMD or PMX file".into()));
        };
        Ok(Parser { file, format })
    }

    pub fn format(&self) -> Format {
        self.format
    }

    pub fn parse(&mut self) -> Result<ModelSummary> {
        let summary = match self.format {
            Format::Pmd => self.parse_pmd(),
            Format::Pmx => self.parse_pmx(),
        };
        summary.map_err(|err| match err {
            ExportError::Io(err) => truncated(err),
            err => err,
        })
    }

    fn parse_pmd(&mut self) -> Result<ModelSummary> {
        let mut summary = ModelSummary { format: Format::Pmd, version: self.read_f32()?, ..Default::default() };
        if summary.version != Format::PMD_VERSION {
            return Err(ExportError::Format(format!("unsupported PMD version {}", summary.version)));
        }
        summary.name = self.read_sjis(20)?;
        summary.comment = self.read_sjis(256)?;

        summary.vertex_count = self.read_u32()? as usize;
        self.skip(summary.vertex_count as u64 * 38)?;
        summary.index_count = self.read_u32()? as usize;
        self.skip(summary.index_count as u64 * 2)?;
        summary.material_count = self.read_u32()? as usize;
        self.skip(summary.material_count as u64 * 70)?;

        summary.bone_count = self.read_u16()? as usize;
        summary.bone_names = self.read_list_n(summary.bone_count, |this| {
            let name = this.read_sjis(20)?;
            this.skip(19)?;
            Ok(name)
        })?;

        summary.ik_count = self.read_u16()? as usize;
        for _ in 0..summary.ik_count {
            self.skip(4)?;
            let links = self.read_u8()?;
            self.skip(6 + links as u64 * 2)?;
        }

        summary.morph_count = self.read_u16()? as usize;
        summary.morph_names = self.read_list_n(summary.morph_count, |this| {
            let name = this.read_sjis(20)?;
            let size = this.read_u32()?;
            this.skip(1 + size as u64 * 16)?;
            Ok(name)
        })?;

        let morph_display = self.read_u8()?;
        self.skip(morph_display as u64 * 2)?;
        summary.display_frame_count = self.read_u8()? as usize;
        self.skip(summary.display_frame_count as u64 * 50)?;
        let bone_display = self.read_u32()?;
        self.skip(bone_display as u64 * 3)?;

        // everything past the display lists is optional in older files
        match self.read_u8() {
            Err(ExportError::Io(err)) if err.kind() == ErrorKind::UnexpectedEof => return Ok(summary),
            Ok(1) => {
                summary.english_name = self.read_sjis(20)?;
                let non_base_morphs = summary.morph_count.saturating_sub(1) as u64;
                self.skip(256 + summary.bone_count as u64 * 20 + non_base_morphs * 20 + summary.display_frame_count as u64 * 50)?;
            }
            other => {
                other?;
            }
        }
        match self.skip(10 * 100) {
            Err(ExportError::Io(err)) if err.kind() == ErrorKind::UnexpectedEof => return Ok(summary),
            other => other?,
        }
        match self.read_u32() {
            Err(ExportError::Io(err)) if err.kind() == ErrorKind::UnexpectedEof => return Ok(summary),
            other => summary.rigid_body_count = other? as usize,
        }
        self.skip(summary.rigid_body_count as u64 * 83)?;
        summary.joint_count = self.read_u32()? as usize;
        self.skip(summary.joint_count as u64 * 124)?;

        Ok(summary)
    }

    fn parse_pmx(&mut self) -> Result<ModelSummary> {
        let mut summary = ModelSummary { format: Format::Pmx, version: self.read_f32()?, ..Default::default() };
        if summary.version != 2.0 && summary.version != 2.1 {
            return Err(ExportError::Format(format!("unsupported PMX version {}", summary.version)));
        }

        let globals_len = self.read_u8()? as usize;
        if globals_len < 8 {
            return Err(ExportError::Format(format!("PMX header declares only {} globals", globals_len)));
        }
        let globals = self.read_list_n(globals_len, |this| this.read_u8())?;
        let size = |i: usize| -> Result<u64> {
            match globals[i] {
                n @ (1 | 2 | 4) => Ok(n as u64),
                n => Err(ExportError::Format(format!("invalid index size {} in PMX header", n))),
            }
        };
        let g = PmxGlobals {
            utf8: match globals[0] {
                0 => false,
                1 => true,
                n => return Err(ExportError::Format(format!("unknown PMX text encoding {}", n))),
            },
            extra_uvs: globals[1] as u64,
            vertex: size(2)?,
            texture: size(3)?,
            material: size(4)?,
            bone: size(5)?,
            morph: size(6)?,
            rigid: size(7)?,
        };

        summary.name = self.read_text(&g)?;
        summary.english_name = self.read_text(&g)?;
        summary.comment = self.read_text(&g)?;
        self.read_text(&g)?;

        summary.vertex_count = self.read_count()?;
        for _ in 0..summary.vertex_count {
            self.skip(32 + g.extra_uvs * 16)?;
            let deform = match self.read_u8()? {
                0 => g.bone,
                1 => 2 * g.bone + 4,
                2 | 4 => 4 * g.bone + 16,
                3 => 2 * g.bone + 4 + 36,
                n => return Err(ExportError::Format(format!("unknown vertex weight type {}", n))),
            };
            self.skip(deform + 4)?;
        }

        summary.index_count = self.read_count()?;
        self.skip(summary.index_count as u64 * g.vertex)?;

        summary.texture_count = self.read_count()?;
        for _ in 0..summary.texture_count {
            self.read_text(&g)?;
        }

        summary.material_count = self.read_count()?;
        for _ in 0..summary.material_count {
            self.read_text(&g)?;
            self.read_text(&g)?;
            // colours, draw flags, edge, texture and sphere indices, sphere mode
            self.skip(44 + 1 + 20 + 2 * g.texture + 1)?;
            let shared_toon = self.read_u8()?;
            self.skip(if shared_toon == 1 { 1 } else { g.texture })?;
            self.read_text(&g)?;
            self.skip(4)?;
        }

        summary.bone_count = self.read_count()?;
        for _ in 0..summary.bone_count {
            summary.bone_names.push(self.read_text(&g)?);
            self.read_text(&g)?;
            self.skip(12 + g.bone + 4)?;
            let flags = self.read_u16()?;
            self.skip(if flags & bone_flags::TAIL_IS_BONE != 0 { g.bone } else { 12 })?;
            if flags & (bone_flags::INHERIT_ROTATION | bone_flags::INHERIT_TRANSLATION) != 0 {
                self.skip(g.bone + 4)?;
            }
            if flags & bone_flags::FIXED_AXIS != 0 {
                self.skip(12)?;
            }
            if flags & bone_flags::LOCAL_AXIS != 0 {
                self.skip(24)?;
            }
            if flags & bone_flags::EXTERNAL_PARENT != 0 {
                self.skip(4)?;
            }
            if flags & bone_flags::IK != 0 {
                summary.ik_count += 1;
                self.skip(g.bone + 8)?;
                let links = self.read_count()?;
                for _ in 0..links {
                    self.skip(g.bone)?;
                    if self.read_u8()? == 1 {
                        self.skip(24)?;
                    }
                }
            }
        }

        summary.morph_count = self.read_count()?;
        for _ in 0..summary.morph_count {
            summary.morph_names.push(self.read_text(&g)?);
            self.read_text(&g)?;
            self.skip(1)?;
            let offset_size = match self.read_u8()? {
                0 | 9 => g.morph + 4,
                1 => g.vertex + 12,
                2 => g.bone + 28,
                3..=7 => g.vertex + 16,
                8 => g.material + 113,
                10 => g.rigid + 25,
                n => return Err(ExportError::Format(format!("unknown morph type {}", n))),
            };
            let offsets = self.read_count()?;
            self.skip(offsets as u64 * offset_size)?;
        }

        summary.display_frame_count = self.read_count()?;
        for _ in 0..summary.display_frame_count {
            self.read_text(&g)?;
            self.read_text(&g)?;
            self.skip(1)?;
            for _ in 0..self.read_count()? {
                let element = self.read_u8()?;
                self.skip(if element == 0 { g.bone } else { g.morph })?;
            }
        }

        summary.rigid_body_count = self.read_count()?;
        for _ in 0..summary.rigid_body_count {
            self.read_text(&g)?;
            self.read_text(&g)?;
            self.skip(g.bone + 4 + 36 + 20 + 1)?;
        }

        summary.joint_count = self.read_count()?;
        for _ in 0..summary.joint_count {
            self.read_text(&g)?;
            self.read_text(&g)?;
            self.skip(1 + 2 * g.rigid + 96)?;
        }

        Ok(summary)
    }

    fn read_list_n<T>(&mut self, n: usize, mut f: impl FnMut(&mut Self) -> Result<T>) -> Result<Vec<T>> {
        (0..n).map(|_| f(self)).collect()
    }

    fn read_sjis(&mut self, width: usize) -> Result<String> {
        let buf = self.read_byte_buffer(width as u64)?;
        let end = buf.iter().position(|&byte| byte == 0).unwrap_or(buf.len());
        let (text, _, _) = SHIFT_JIS.decode(&buf[..end]);
        Ok(text.into_owned())
    }

    fn read_text(&mut self, g: &PmxGlobals) -> Result<String> {
        let len = self.read_count()?;
        let buf = self.read_byte_buffer(len as u64)?;
        if g.utf8 {
            Ok(String::from_utf8_lossy(&buf).into_owned())
        } else {
            let (text, _) = UTF_16LE.decode_without_bom_handling(&buf);
            Ok(text.into_owned())
        }
    }

    /// A non-negative i32 count.
    fn read_count(&mut self) -> Result<usize> {
        match self.read_i32()? {
            n if n >= 0 => Ok(n as usize),
            n => Err(ExportError::Format(format!("negative count {}", n))),
        }
    }

    fn read_byte_buffer(&mut self, len: u64) -> Result<Vec<u8>> {
        let mut buffer = vec![];
        (&mut self.file).take(len).read_to_end(&mut buffer)?;
        if (buffer.len() as u64) < len {
            return Err(io::Error::from(ErrorKind::UnexpectedEof).into());
        }
        Ok(buffer)
    }

    fn skip(&mut self, len: u64) -> Result<()> {
        let skipped = io::copy(&mut (&mut self.file).take(len), &mut io::sink())?;
        if skipped < len {
            return Err(io::Error::from(ErrorKind::UnexpectedEof).into());
        }
        Ok(())
    }

    fn read_u8(&mut self) -> Result<u8> {
        Ok(read_bytes::<1>(&mut self.file)?[0])
    }

    fn read_u16(&mut self) -> Result<u16> {
        Ok(u16::from_le_bytes(read_bytes(&mut self.file)?))
    }

    fn read_u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(read_bytes(&mut self.file)?))
    }

    fn read_i32(&mut self) -> Result<i32> {
        Ok(i32::from_le_bytes(read_bytes(&mut self.file)?))
    }

    fn read_f32(&mut self) -> Result<f32> {
        Ok(f32::from_le_bytes(read_bytes(&mut self.file)?))
    }
}

fn truncated(err: io::Error) -> ExportError {
    if err.kind() == ErrorKind::UnexpectedEof {
        ExportError::Format("unexpected end of file".into())
    } else {
        ExportError::Io(err)
    }
}

fn read_bytes<const N: usize>(file: &mut impl Read) -> io::Result<[u8; N]> {
    let mut buffer = [0; N];
    file.read_exact(&mut buffer)?;

    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::convert::tests::sample_document;
    use crate::convert::Converter;
    use crate::ExportSettings;

    fn written(format: Format) -> Vec<u8> {
        let settings = ExportSettings { format, ..Default::default() };
        let model = Converter::new(&settings).convert_document(&sample_document()).unwrap();
        let mut buf = vec![];
        model.write(&mut buf, &settings).unwrap();
        buf
    }

    #[test]
    fn reads_back_pmd() {
        let summary = Parser::new(&written(Format::Pmd)[..]).unwrap().parse().unwrap();
        assert_eq!(summary.format, Format::Pmd);
        assert_eq!(summary.name, "model");
        assert_eq!(summary.vertex_count, 4);
        assert_eq!(summary.index_count, 6);
        assert_eq!(summary.material_count, 1);
        assert_eq!(summary.bone_count, 6);
        assert_eq!(summary.ik_count, 1);
        // base record plus one target
        assert_eq!(summary.morph_names, ["base", "smile"]);
        assert_eq!(summary.bone_names[3], "bone3先");
        assert_eq!(summary.bone_names[4], "bone3IK");
        assert_eq!(summary.english_name, "model");
    }

    #[test]
    fn reads_back_pmx() {
        let summary = Parser::new(&written(Format::Pmx)[..]).unwrap().parse().unwrap();
        assert_eq!(summary.format, Format::Pmx);
        assert_eq!(summary.version, 2.0);
        assert_eq!(summary.vertex_count, 4);
        assert_eq!(summary.index_count, 6);
        assert_eq!(summary.texture_count, 1);
        assert_eq!(summary.bone_count, 6);
        assert_eq!(summary.ik_count, 1);
        assert_eq!(summary.morph_names, ["smile"]);
        // root, expressions, one rig group
        assert_eq!(summary.display_frame_count, 3);
        assert_eq!(summary.rigid_body_count, 0);
    }

    #[test]
    fn bad_magic_is_rejected() {
        assert!(matches!(Parser::new(&b"glTF...."[..]), Err(ExportError::Format(_))));
        assert!(matches!(Parser::new(&b"PM"[..]), Err(ExportError::Format(_))));
    }

    #[test]
    fn truncated_files_are_format_errors() {
        let buf = written(Format::Pmx);
        let result = Parser::new(&buf[..buf.len() / 2]).unwrap().parse();
        assert!(matches!(result, Err(ExportError::Format(_))));
    }

    #[test]
    fn unknown_version_is_rejected() {
        let mut buf = written(Format::Pmd);
        buf[3..7].copy_from_slice(&3.5f32.to_le_bytes());
        assert!(matches!(Parser::new(&buf[..]).unwrap().parse(), Err(ExportError::Format(_))));
    }
}
