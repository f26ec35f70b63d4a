// =============================================================================
// LIGHTS - Camera/light transforms and the per-frame light uniform block
// =============================================================================
//
// The camera and every spot light are "rotating" transforms: a position
// plus an euler rotation advancing at a constant speed. The light block is
// written into the slot's region of a host-visible ring each frame; its
// layout follows std140 (every member padded to 16 bytes).

use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec3, Vec4};
use serde::Deserialize;
use std::f32::consts::{FRAC_PI_2, FRAC_PI_8, PI};

pub const MAX_LIGHTS: usize = 16;

/// Position + rotation animated by time, projected with a perspective lens
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct RotatingView {
    pub position: Vec3,
    pub rotation: Vec3,
    pub rotation_speed: Vec3,
    pub fov: f32,
    pub near: f32,
    pub far: f32,
}

impl Default for RotatingView {
    fn default() -> Self {
        // Fixed camera looking across the scene from the -X side
        Self {
            position: Vec3::new(-250.0, 100.0, 0.0),
            rotation: Vec3::new(0.0, -FRAC_PI_2, 0.0),
            rotation_speed: Vec3::ZERO,
            fov: 1.0,
            near: 10.0,
            far: 2500.0,
        }
    }
}

impl RotatingView {
    pub fn view(&self, t: f32) -> Mat4 {
        let angles = self.rotation + self.rotation_speed * t;
        let model = Mat4::from_translation(self.position)
            * Mat4::from_rotation_x(angles.x)
            * Mat4::from_rotation_y(angles.y)
            * Mat4::from_rotation_z(angles.z);
        model.inverse()
    }

    /// Perspective with Y flipped for Vulkan's downward clip-space Y
    pub fn projection(&self, aspect: f32) -> Mat4 {
        Mat4::perspective_rh(self.fov, aspect, self.near, self.far)
            * Mat4::from_scale(Vec3::new(1.0, -1.0, 1.0))
    }

    pub fn view_projection(&self, t: f32, aspect: f32) -> Mat4 {
        self.projection(aspect) * self.view(t)
    }
}

/// Spot light casting a shadow into its own shadow-map layer
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct SpotLight {
    pub position: Vec3,
    pub rotation: Vec3,
    pub rotation_speed: Vec3,
    pub color: Vec3,
    /// Constant, linear, quadratic
    pub attenuation: Vec3,
    pub fov_outer: f32,
    pub fov_inner: f32,
}

impl Default for SpotLight {
    fn default() -> Self {
        Self {
            position: Vec3::new(0.0, 100.0, 0.0),
            rotation: Vec3::ZERO,
            rotation_speed: Vec3::Y,
            color: Vec3::ONE,
            attenuation: Vec3::new(1.0, 0.5, 0.02),
            fov_outer: FRAC_PI_2,
            fov_inner: FRAC_PI_8,
        }
    }
}

impl SpotLight {
    const SHADOW_NEAR: f32 = 1.0;
    const SHADOW_FAR: f32 = 2500.0;

    /// Four lights on one mast, a quarter turn apart, spinning together
    pub fn demo_set() -> Vec<SpotLight> {
        [0.0, FRAC_PI_2, PI, PI + FRAC_PI_2]
            .into_iter()
            .map(|y| SpotLight {
                rotation: Vec3::new(0.0, y, 0.0),
                ..SpotLight::default()
            })
            .collect()
    }

    fn shadow_view(&self) -> RotatingView {
        RotatingView {
            position: self.position,
            rotation: self.rotation,
            rotation_speed: self.rotation_speed,
            fov: self.fov_outer,
            near: Self::SHADOW_NEAR,
            far: Self::SHADOW_FAR,
        }
    }

    pub fn shadow_view_matrix(&self, t: f32) -> Mat4 {
        self.shadow_view().view(t)
    }

    /// Square shadow-map projection covering the outer cone
    pub fn shadow_view_projection(&self, t: f32) -> Mat4 {
        self.shadow_view().view_projection(t, 1.0)
    }

    pub fn uniform(&self, t: f32) -> LightUniform {
        let shadow_vp = self.shadow_view_projection(t);
        let direction = shadow_vp * Vec4::new(0.0, 0.0, 1.0, 0.0);
        LightUniform {
            shadow_vp: shadow_vp.to_cols_array(),
            position: self.position.to_array(),
            inner_dot: (self.fov_inner / 2.0).cos(),
            direction: direction.truncate().to_array(),
            outer_dot: (self.fov_outer / 2.0).cos(),
            color: self.color.to_array(),
            _pad0: 0.0,
            attenuation: self.attenuation.to_array(),
            _pad1: 0.0,
        }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct LightUniform {
    pub shadow_vp: [f32; 16],
    pub position: [f32; 3],
    pub inner_dot: f32,
    pub direction: [f32; 3],
    pub outer_dot: f32,
    pub color: [f32; 3],
    _pad0: f32,
    pub attenuation: [f32; 3],
    _pad1: f32,
}

/// Uniform block read by the lighting subpass
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct LightBlock {
    pub camera_position: [f32; 3],
    pub light_count: u32,
    pub lights: [LightUniform; MAX_LIGHTS],
}

impl LightBlock {
    pub const SIZE: u64 = std::mem::size_of::<LightBlock>() as u64;

    pub fn new(camera_position: Vec3, lights: &[SpotLight], t: f32) -> Self {
        let mut block = LightBlock::zeroed();
        block.camera_position = camera_position.to_array();
        for (slot, light) in block.lights.iter_mut().zip(lights) {
            *slot = light.uniform(t);
        }
        block.light_count = lights.len().min(MAX_LIGHTS) as u32;
        block
    }

    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::bytes_of(self)
    }
}

/// One light block per frame slot, each at an aligned offset
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LightRing {
    pub stride: u64,
    pub slots: u32,
}

impl LightRing {
    pub fn new(slots: u32, min_uniform_alignment: u64) -> Self {
        let align = min_uniform_alignment.max(1);
        Self {
            stride: LightBlock::SIZE.div_ceil(align) * align,
            slots,
        }
    }

    pub fn size(&self) -> u64 {
        self.stride * self.slots as u64
    }

    pub fn offset(&self, slot: u32) -> u64 {
        self.stride * slot as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_std140_layout() {
        assert_eq!(std::mem::size_of::<LightUniform>(), 128);
        assert_eq!(std::mem::offset_of!(LightUniform, position), 64);
        assert_eq!(std::mem::offset_of!(LightUniform, attenuation), 112);
        assert_eq!(std::mem::offset_of!(LightBlock, lights), 16);
        assert_eq!(LightBlock::SIZE, 16 + 128 * MAX_LIGHTS as u64);
    }

    #[test]
    fn test_ring_offsets_are_aligned() {
        let ring = LightRing::new(3, 256);
        assert_eq!(ring.stride % 256, 0);
        assert!(ring.stride >= LightBlock::SIZE);
        assert_eq!(ring.offset(0), 0);
        assert_eq!(ring.offset(2), ring.stride * 2);
        assert_eq!(ring.size(), ring.stride * 3);
        // Regions never overlap
        assert!(ring.offset(1) >= ring.offset(0) + LightBlock::SIZE);
    }

    #[test]
    fn test_block_clamps_light_count() {
        let lights = vec![SpotLight::default(); MAX_LIGHTS + 4];
        let block = LightBlock::new(Vec3::ZERO, &lights, 0.0);
        assert_eq!(block.light_count, MAX_LIGHTS as u32);
    }

    #[test]
    fn test_cone_cosines() {
        let uniform = SpotLight::default().uniform(0.0);
        assert!((uniform.outer_dot - (FRAC_PI_2 / 2.0).cos()).abs() < 1e-6);
        assert!(uniform.inner_dot > uniform.outer_dot);
    }

    #[test]
    fn test_view_inverts_placement() {
        let view = RotatingView::default();
        let eye = view.view(0.0).transform_point3(view.position);
        assert!(eye.length() < 1e-3);
    }

    #[test]
    fn test_rotation_advances_with_time() {
        let light = SpotLight::default();
        let a = light.shadow_view_projection(0.0);
        let b = light.shadow_view_projection(1.0);
        assert_ne!(a, b);
        // A full turn about Y brings the light back
        let c = light.shadow_view_projection(2.0 * PI);
        assert!(a.abs_diff_eq(c, 1e-3));
    }

    #[test]
    fn test_demo_set_is_a_quarter_turn_apart() {
        let lights = SpotLight::demo_set();
        assert_eq!(lights.len(), 4);
        assert_eq!(lights[1].rotation.y, FRAC_PI_2);
        assert!(lights.iter().all(|l| l.rotation_speed == Vec3::Y));
    }
}
