// Visibility culling against a view-projection frustum
//
// The eight corners of an object's bounding box are transformed to clip
// space and classified against -w <= x <= w, -w <= y <= w, 0 <= z <= w.
// If every corner is outside the same plane the box is culled. Working in
// homogeneous coordinates keeps corners behind the eye (w <= 0) honest:
// dividing them by w would mirror them in front of the camera.

use glam::{Mat4, Vec3, Vec4};

const OUT_LEFT: u8 = 1 << 0;
const OUT_RIGHT: u8 = 1 << 1;
const OUT_BOTTOM: u8 = 1 << 2;
const OUT_TOP: u8 = 1 << 3;
const OUT_NEAR: u8 = 1 << 4;
const OUT_FAR: u8 = 1 << 5;

/// Axis-aligned bounding box in object space
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Aabb {
    pub min: Vec3,
    pub max: Vec3,
}

impl Aabb {
    pub fn new(min: Vec3, max: Vec3) -> Self {
        Self { min, max }
    }

    /// Smallest box containing every point
    #[cfg(test)]
    pub fn from_points(points: impl IntoIterator<Item = Vec3>) -> Option<Self> {
        let mut points = points.into_iter();
        let first = points.next()?;
        Some(points.fold(Self::new(first, first), |aabb, p| {
            Self::new(aabb.min.min(p), aabb.max.max(p))
        }))
    }

    pub fn corners(&self) -> [Vec4; 8] {
        let (a, b) = (self.min, self.max);
        [
            Vec4::new(a.x, a.y, a.z, 1.0),
            Vec4::new(b.x, a.y, a.z, 1.0),
            Vec4::new(a.x, b.y, a.z, 1.0),
            Vec4::new(b.x, b.y, a.z, 1.0),
            Vec4::new(a.x, a.y, b.z, 1.0),
            Vec4::new(b.x, a.y, b.z, 1.0),
            Vec4::new(a.x, b.y, b.z, 1.0),
            Vec4::new(b.x, b.y, b.z, 1.0),
        ]
    }
}

fn outcode(clip: Vec4) -> u8 {
    let mut code = 0;
    if clip.x < -clip.w {
        code |= OUT_LEFT;
    }
    if clip.x > clip.w {
        code |= OUT_RIGHT;
    }
    if clip.y < -clip.w {
        code |= OUT_BOTTOM;
    }
    if clip.y > clip.w {
        code |= OUT_TOP;
    }
    if clip.z < 0.0 {
        code |= OUT_NEAR;
    }
    if clip.z > clip.w {
        code |= OUT_FAR;
    }
    code
}

/// Conservative test: `false` only when the box is certainly outside
pub fn is_visible(aabb: &Aabb, view_proj: &Mat4) -> bool {
    let clip = aabb.corners().map(|corner| *view_proj * corner);

    if clip.iter().all(|c| c.w <= 0.0) {
        return false;
    }

    let shared = clip.iter().fold(0xFF, |acc, &c| acc & outcode(c));
    shared == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f32::consts::FRAC_PI_2;

    fn camera() -> Mat4 {
        // Looking down -Z from the origin
        Mat4::perspective_rh(FRAC_PI_2, 1.0, 0.1, 100.0)
    }

    fn cube(center: Vec3, half: f32) -> Aabb {
        Aabb::new(center - Vec3::splat(half), center + Vec3::splat(half))
    }

    #[test]
    fn test_box_in_front_is_visible() {
        assert!(is_visible(&cube(Vec3::new(0.0, 0.0, -10.0), 1.0), &camera()));
    }

    #[test]
    fn test_box_behind_eye_is_culled() {
        assert!(!is_visible(&cube(Vec3::new(0.0, 0.0, 10.0), 1.0), &camera()));
    }

    #[test]
    fn test_box_outside_one_plane_is_culled() {
        let vp = camera();
        // 90 degree fov: at depth 10 the frustum spans x in [-10, 10]
        assert!(!is_visible(&cube(Vec3::new(-20.0, 0.0, -10.0), 1.0), &vp));
        assert!(!is_visible(&cube(Vec3::new(0.0, 20.0, -10.0), 1.0), &vp));
        assert!(!is_visible(&cube(Vec3::new(0.0, 0.0, -150.0), 1.0), &vp));
    }

    #[test]
    fn test_box_straddling_a_plane_is_visible() {
        let vp = camera();
        assert!(is_visible(&cube(Vec3::new(-10.0, 0.0, -10.0), 1.0), &vp));
        assert!(is_visible(&cube(Vec3::new(0.0, 0.0, -100.0), 1.0), &vp));
    }

    #[test]
    fn test_box_outside_on_different_planes_is_kept() {
        // Corners are out left and out right but no single plane rejects them all
        let wide = Aabb::new(Vec3::new(-50.0, -1.0, -11.0), Vec3::new(50.0, 1.0, -9.0));
        assert!(is_visible(&wide, &camera()));
    }

    #[test]
    fn test_box_through_the_near_plane_is_visible() {
        let vp = camera();
        // Extends from behind the eye to past the far plane; the point (0, 0, -1) is on screen
        let tunnel = Aabb::new(Vec3::new(-1.0, -1.0, -200.0), Vec3::new(1.0, 1.0, 1.0));
        assert!(is_visible(&tunnel, &vp));

        // Dividing by w first flips the corners behind the eye past the far
        // plane, so a divide-then-classify test would reject this box
        let projected_far = tunnel
            .corners()
            .iter()
            .map(|&c| vp * c)
            .all(|c| c.z / c.w > 1.0);
        assert!(projected_far);
    }

    #[test]
    fn test_from_points() {
        let aabb = Aabb::from_points([
            Vec3::new(1.0, -2.0, 3.0),
            Vec3::new(-1.0, 4.0, 0.0),
            Vec3::new(0.5, 0.0, 5.0),
        ])
        .unwrap();
        assert_eq!(aabb.min, Vec3::new(-1.0, -2.0, 0.0));
        assert_eq!(aabb.max, Vec3::new(1.0, 4.0, 5.0));
        assert!(Aabb::from_points(std::iter::empty()).is_none());
    }
}
