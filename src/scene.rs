// =============================================================================
// SCENE - Model data consumed by the renderer
// =============================================================================
//
// Models come from BOBJ files: one shared vertex and index stream, a list
// of objects (index range + bounding box + optional texture) and RGBA8
// textures. When no model is configured a small procedural scene is used.
//
// BOBJ layout (little endian, every section located by the header):
//   header   magic "BOBJ", version 0x100, section offsets and counts
//   objects  "OBJ " index offset/count, texture index, aabb min/max
//   textures "TXTR" width, height, offset into texture data
//   "TXDT" texture bytes | "VXDT" vertices | "IXDT" u32 indices

use anyhow::{bail, ensure, Context, Result};
use bytemuck::{Pod, Zeroable};
use glam::Vec3;
use std::path::Path;

use crate::cull::Aabb;
use crate::platform;

const fn fourcc(code: &[u8; 4]) -> u32 {
    u32::from_le_bytes(*code)
}

const BOBJ_VERSION: u32 = 0x100;
const FILE_MAGIC: u32 = fourcc(b"BOBJ");
const OBJECT_MAGIC: u32 = fourcc(b"OBJ ");
const TEXTURE_MAGIC: u32 = fourcc(b"TXTR");
const TEXTURE_DATA_MAGIC: u32 = fourcc(b"TXDT");
const VERTEX_DATA_MAGIC: u32 = fourcc(b"VXDT");
const INDEX_DATA_MAGIC: u32 = fourcc(b"IXDT");
const NO_TEXTURE: u32 = u32::MAX;

/// Interleaved vertex, identical to the BOBJ on-disk layout
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Pod, Zeroable)]
pub struct Vertex {
    pub position: [f32; 3],
    pub texcoord: [f32; 2],
    pub normal: [f32; 3],
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct FileHeader {
    magic: u32,
    version: u32,
    objects_start: u32,
    textures_start: u32,
    vertex_start: u32,
    index_start: u32,
    texdata_start: u32,
    vertex_count: u32,
    index_count: u32,
    object_count: u32,
    texture_count: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct ObjectHeader {
    magic: u32,
    index_offset: u32,
    index_count: u32,
    texture_index: u32,
    aabb_min: [f32; 3],
    aabb_max: [f32; 3],
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct TextureHeader {
    magic: u32,
    width: u32,
    height: u32,
    offset: u32,
}

/// RGBA8 (sRGB) pixels, tightly packed
#[derive(Debug, Clone, PartialEq)]
pub struct Texture {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
}

/// One drawable range of the shared index buffer
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DrawableObject {
    pub index_start: u32,
    pub index_count: u32,
    pub aabb: Aabb,
    pub texture: Option<u32>,
}

#[derive(Debug, Clone, Default)]
pub struct ModelData {
    pub objects: Vec<DrawableObject>,
    pub vertices: Vec<Vertex>,
    pub indices: Vec<u32>,
    pub textures: Vec<Texture>,
}

fn read<T: Pod>(bytes: &[u8], offset: usize, what: &str) -> Result<T> {
    let end = offset
        .checked_add(std::mem::size_of::<T>())
        .context("offset overflow")?;
    let slice = bytes
        .get(offset..end)
        .with_context(|| format!("{what} at {offset} runs past the end of the file"))?;
    Ok(bytemuck::pod_read_unaligned(slice))
}

fn read_array<T: Pod>(bytes: &[u8], offset: usize, count: usize, what: &str) -> Result<Vec<T>> {
    (0..count)
        .map(|i| read(bytes, offset + i * std::mem::size_of::<T>(), what))
        .collect()
}

fn expect_section(bytes: &[u8], start: u32, magic: u32, what: &str) -> Result<()> {
    let tag_offset = (start as usize)
        .checked_sub(4)
        .with_context(|| format!("{what} section starts inside the header"))?;
    let tag: u32 = read(bytes, tag_offset, what)?;
    ensure!(tag == magic, "{what} section tag mismatch ({tag:#010x})");
    Ok(())
}

impl ModelData {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let bytes = platform::load_file(path)?;
        let model = Self::parse_bobj(&bytes)
            .with_context(|| format!("Failed to parse model {}", path.display()))?;
        log::info!(
            "Loaded {}: {} objects, {} vertices, {} indices, {} textures",
            path.display(),
            model.objects.len(),
            model.vertices.len(),
            model.indices.len(),
            model.textures.len()
        );
        Ok(model)
    }

    pub fn parse_bobj(bytes: &[u8]) -> Result<Self> {
        let header: FileHeader = read(bytes, 0, "file header")?;
        ensure!(header.magic == FILE_MAGIC, "not a BOBJ file");
        ensure!(
            header.version == BOBJ_VERSION,
            "unsupported BOBJ version {:#x}",
            header.version
        );

        let object_headers: Vec<ObjectHeader> = read_array(
            bytes,
            header.objects_start as usize,
            header.object_count as usize,
            "object header",
        )?;
        let texture_headers: Vec<TextureHeader> = read_array(
            bytes,
            header.textures_start as usize,
            header.texture_count as usize,
            "texture header",
        )?;

        if header.texture_count > 0 {
            expect_section(bytes, header.texdata_start, TEXTURE_DATA_MAGIC, "texture data")?;
        }
        expect_section(bytes, header.vertex_start, VERTEX_DATA_MAGIC, "vertex data")?;
        expect_section(bytes, header.index_start, INDEX_DATA_MAGIC, "index data")?;

        let mut vertices: Vec<Vertex> = read_array(
            bytes,
            header.vertex_start as usize,
            header.vertex_count as usize,
            "vertex",
        )?;
        // Texture rows are stored top-down
        for vertex in &mut vertices {
            vertex.texcoord[1] = 1.0 - vertex.texcoord[1];
        }

        let indices: Vec<u32> = read_array(
            bytes,
            header.index_start as usize,
            header.index_count as usize,
            "index",
        )?;
        if let Some(bad) = indices.iter().find(|&&i| i >= header.vertex_count) {
            bail!("index {bad} out of range ({} vertices)", header.vertex_count);
        }

        let mut textures = Vec::with_capacity(texture_headers.len());
        for (i, t) in texture_headers.iter().enumerate() {
            ensure!(t.magic == TEXTURE_MAGIC, "texture {i} has a bad tag");
            ensure!(t.width > 0 && t.height > 0, "texture {i} is empty");
            let size = t.width as usize * t.height as usize * 4;
            let start = header.texdata_start as usize + t.offset as usize;
            let pixels = bytes
                .get(start..start + size)
                .with_context(|| format!("texture {i} data runs past the end of the file"))?;
            textures.push(Texture {
                width: t.width,
                height: t.height,
                pixels: pixels.to_vec(),
            });
        }

        let mut objects = Vec::with_capacity(object_headers.len());
        for (i, o) in object_headers.iter().enumerate() {
            ensure!(o.magic == OBJECT_MAGIC, "object {i} has a bad tag");
            let end = o.index_offset as u64 + o.index_count as u64;
            ensure!(
                end <= header.index_count as u64,
                "object {i} indexes past the index buffer"
            );
            let texture = match o.texture_index {
                NO_TEXTURE => None,
                t if t < header.texture_count => Some(t),
                t => bail!("object {i} uses missing texture {t}"),
            };
            objects.push(DrawableObject {
                index_start: o.index_offset,
                index_count: o.index_count,
                aabb: Aabb::new(Vec3::from(o.aabb_min), Vec3::from(o.aabb_max)),
                texture,
            });
        }

        Ok(Self {
            objects,
            vertices,
            indices,
            textures,
        })
    }

    /// Textured ground plane with an untextured cube standing on it
    pub fn procedural() -> Self {
        let mut model = Self::default();

        let ground = model.push_quad_grid(400.0, 8.0);
        model.objects.push(DrawableObject {
            texture: Some(0),
            ..ground
        });
        let cube = model.push_box(Vec3::new(-40.0, 0.0, -40.0), Vec3::new(40.0, 80.0, 40.0));
        model.objects.push(cube);

        let light = [0xC0, 0xC0, 0xC0, 0xFF];
        let dark = [0x40, 0x40, 0x40, 0xFF];
        model.textures.push(checker_texture(64, 8, light, dark));
        model
    }

    /// Flat square on y = 0, texture repeated `tiling` times
    fn push_quad_grid(&mut self, half: f32, tiling: f32) -> DrawableObject {
        let base = self.vertices.len() as u32;
        let index_start = self.indices.len() as u32;
        for (x, z, u, v) in [
            (-half, -half, 0.0, 0.0),
            (half, -half, tiling, 0.0),
            (half, half, tiling, tiling),
            (-half, half, 0.0, tiling),
        ] {
            self.vertices.push(Vertex {
                position: [x, 0.0, z],
                texcoord: [u, v],
                normal: [0.0, 1.0, 0.0],
            });
        }
        // Counter-clockwise seen from above
        self.indices
            .extend([0, 2, 1, 0, 3, 2].iter().map(|i| base + i));
        DrawableObject {
            index_start,
            index_count: 6,
            aabb: Aabb::new(Vec3::new(-half, 0.0, -half), Vec3::new(half, 0.0, half)),
            texture: None,
        }
    }

    fn push_box(&mut self, min: Vec3, max: Vec3) -> DrawableObject {
        let index_start = self.indices.len() as u32;
        let faces: [(Vec3, Vec3, Vec3); 6] = [
            (Vec3::X, Vec3::NEG_Z, Vec3::Y),
            (Vec3::NEG_X, Vec3::Z, Vec3::Y),
            (Vec3::Y, Vec3::X, Vec3::NEG_Z),
            (Vec3::NEG_Y, Vec3::X, Vec3::Z),
            (Vec3::Z, Vec3::X, Vec3::Y),
            (Vec3::NEG_Z, Vec3::NEG_X, Vec3::Y),
        ];
        let center = (min + max) * 0.5;
        let half = (max - min) * 0.5;
        for (normal, right, up) in faces {
            let base = self.vertices.len() as u32;
            for (s, t) in [(-1.0, -1.0), (1.0, -1.0), (1.0, 1.0), (-1.0, 1.0)] {
                let p = center + (normal + right * s + up * t) * half;
                self.vertices.push(Vertex {
                    position: p.to_array(),
                    texcoord: [(s + 1.0) * 0.5, (1.0 - t) * 0.5],
                    normal: normal.to_array(),
                });
            }
            self.indices
                .extend([0, 1, 2, 0, 2, 3].iter().map(|i| base + i));
        }
        DrawableObject {
            index_start,
            index_count: 36,
            aabb: Aabb::new(min, max),
            texture: None,
        }
    }

    pub fn vertex_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.vertices)
    }

    pub fn index_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.indices)
    }
}

/// `size`x`size` RGBA8 checkerboard with `cells` squares per side
pub fn checker_texture(size: u32, cells: u32, a: [u8; 4], b: [u8; 4]) -> Texture {
    let cell = (size / cells.max(1)).max(1);
    let pixels = (0..size)
        .flat_map(|y| (0..size).map(move |x| ((x / cell) + (y / cell)) % 2 == 0))
        .flat_map(|even| if even { a } else { b })
        .collect();
    Texture {
        width: size,
        height: size,
        pixels,
    }
}
