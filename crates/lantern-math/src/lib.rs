// SPDX-License-Identifier: CEPL-1.0
//! Camera pose and projection helpers.

pub use glam;

use bitflags::bitflags;
use glam::{Mat4, Quat, Vec3};

bitflags! {
    /// Movement keys currently held.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct MoveKeys: u8 {
        const FORWARD    = 1 << 0;
        const BACK       = 1 << 1;
        const LEFT       = 1 << 2;
        const RIGHT      = 1 << 3;
        const LOOK_LEFT  = 1 << 4;
        const LOOK_RIGHT = 1 << 5;
        const LOOK_UP    = 1 << 6;
        const LOOK_DOWN  = 1 << 7;
    }
}

/// First-person camera: a position plus yaw/pitch in radians.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Camera {
    pub position: Vec3,
    pub yaw: f32,
    pub pitch: f32,
    pub fov_y: f32,
    pub near: f32,
    pub far: f32,
}

impl Camera {
    pub fn new(position: Vec3, fov_deg: f32) -> Self {
        Self {
            position,
            yaw: 0.0,
            pitch: 0.0,
            fov_y: fov_deg.to_radians(),
            near: 0.1,
            far: 100.0,
        }
    }

    fn orientation(&self) -> Quat {
        let pitch = Quat::from_axis_angle(Vec3::X, self.pitch);
        let yaw = Quat::from_axis_angle(Vec3::Y, self.yaw);
        (pitch * yaw).normalize()
    }

    /// World -> camera transform.
    pub fn view(&self) -> Mat4 {
        Mat4::from_quat(self.orientation()) * Mat4::from_translation(-self.position)
    }

    /// Right-handed perspective with 0..1 depth and Y flipped for Vulkan clip space.
    pub fn projection(&self, aspect: f32) -> Mat4 {
        let mut proj = Mat4::perspective_rh(self.fov_y, aspect.max(f32::EPSILON), self.near, self.far);
        proj.y_axis.y *= -1.0;
        proj
    }

    /// Camera-space +Z expressed in world space; the camera looks down -forward.
    pub fn back_axis(&self) -> Vec3 {
        let v = self.view();
        Vec3::new(v.x_axis.z, v.y_axis.z, v.z_axis.z)
    }

    pub fn right_axis(&self) -> Vec3 {
        let v = self.view();
        Vec3::new(v.x_axis.x, v.y_axis.x, v.z_axis.x)
    }

    /// Apply held keys for `dt_ms` milliseconds.
    pub fn apply_keys(&mut self, keys: MoveKeys, dt_ms: f32, move_speed: f32, look_speed: f32) {
        let step = dt_ms * move_speed;
        let turn = dt_ms * look_speed;
        let back = self.back_axis();
        let right = self.right_axis();

        if keys.contains(MoveKeys::FORWARD) {
            self.position -= back * step;
        }
        if keys.contains(MoveKeys::BACK) {
            self.position += back * step;
        }
        if keys.contains(MoveKeys::LEFT) {
            self.position -= right * step;
        }
        if keys.contains(MoveKeys::RIGHT) {
            self.position += right * step;
        }
        if keys.contains(MoveKeys::LOOK_LEFT) {
            self.yaw -= turn;
        }
        if keys.contains(MoveKeys::LOOK_RIGHT) {
            self.yaw += turn;
        }
        if keys.contains(MoveKeys::LOOK_UP) {
            self.pitch += turn;
        }
        if keys.contains(MoveKeys::LOOK_DOWN) {
            self.pitch -= turn;
        }
        self.clamp_pitch();
    }

    /// Mouse drag in pixels since the last frame.
    pub fn apply_drag(&mut self, dx: f32, dy: f32, sensitivity: f32) {
        self.yaw += dx * sensitivity;
        self.pitch -= dy * sensitivity;
        self.clamp_pitch();
    }

    fn clamp_pitch(&mut self) {
        let limit = std::f32::consts::FRAC_PI_2 - 0.01;
        self.pitch = self.pitch.clamp(-limit, limit);
    }
}

/// Rotate `point` about the world Y axis by `degrees`.
pub fn orbit_y(point: Vec3, degrees: f32) -> Vec3 {
    Quat::from_rotation_y(degrees.to_radians()) * point
}

/// Pixel position to normalized device coordinates (-1..1, +Y down like Vulkan).
pub fn pixel_to_ndc(x: f32, y: f32, width: f32, height: f32) -> (f32, f32) {
    (x / width * 2.0 - 1.0, y / height * 2.0 - 1.0)
}
