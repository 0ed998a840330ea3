//! 2-D point mass that has to reach a randomly placed target.

use ndarray::{Array1, Array3};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};
use vmail::env::{EnvInfo, Environment, Observation, StepResult};
use vmail::spaces::{Box as BoxSpace, DynSpace};
use vmail::{Result, VmailError};

/// Rendered frame size in pixels.
pub const FRAME_SIZE: usize = 64;

const BACKGROUND: [u8; 3] = [32, 32, 40];
const TARGET_COLOR: [u8; 3] = [220, 60, 60];
const POINT_COLOR: [u8; 3] = [60, 200, 90];

/// PointReach environment
///
/// The point lives in `[-1, 1]²` and is pushed by a force action in
/// `[-1, 1]²`. Walls stop the point and zero the normal velocity.
///
/// Observation: 64×64 RGB frame with the target and the point drawn as
/// discs, proprio `[x, y, vx, vy]`. The target is only visible in the frame.
///
/// Reward: negative distance to the target. The episode terminates
/// (discount 0) once the point is within `reach_radius`.
pub struct PointReach {
    dt: f32,
    damping: f32,
    force_scale: f32,
    reach_radius: f32,
    action_noise: Option<Normal<f32>>,

    position: [f32; 2],
    velocity: [f32; 2],
    target: [f32; 2],
    started: bool,
    rng: StdRng,
}

impl PointReach {
    pub fn new(seed: u64) -> Self {
        Self {
            dt: 0.1,
            damping: 0.8,
            force_scale: 10.0,
            reach_radius: 0.1,
            action_noise: None,
            position: [0.0; 2],
            velocity: [0.0; 2],
            target: [0.0; 2],
            started: false,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Add zero-mean Gaussian noise with standard deviation `std` to every
    /// applied force.
    pub fn with_action_noise(mut self, std: f32) -> Result<Self> {
        let normal = Normal::new(0.0, std)
            .map_err(|e| VmailError::Config(format!("invalid action noise {}: {}", std, e)))?;
        self.action_noise = Some(normal);
        Ok(self)
    }

    pub fn with_reach_radius(mut self, radius: f32) -> Self {
        self.reach_radius = radius;
        self
    }

    pub fn position(&self) -> [f32; 2] {
        self.position
    }

    pub fn velocity(&self) -> [f32; 2] {
        self.velocity
    }

    pub fn target(&self) -> [f32; 2] {
        self.target
    }

    pub fn distance(&self) -> f32 {
        let dx = self.target[0] - self.position[0];
        let dy = self.target[1] - self.position[1];
        (dx * dx + dy * dy).sqrt()
    }

    fn observe(&self) -> Observation {
        let proprio = Array1::from_vec(vec![
            self.position[0],
            self.position[1],
            self.velocity[0],
            self.velocity[1],
        ]);
        Observation::new(self.render()).with_proprio(proprio)
    }

    /// Draw the scene into an `[H, W, 3]` frame.
    pub fn render(&self) -> Array3<u8> {
        let mut frame = Array3::zeros((FRAME_SIZE, FRAME_SIZE, 3));
        for ((_, _, c), px) in frame.indexed_iter_mut() {
            *px = BACKGROUND[c];
        }
        draw_disc(&mut frame, self.target, 4.0, TARGET_COLOR);
        draw_disc(&mut frame, self.position, 3.0, POINT_COLOR);
        frame
    }
}

/// Map arena coordinates to pixel coordinates, y pointing up.
fn to_pixel(p: [f32; 2]) -> (f32, f32) {
    let scale = (FRAME_SIZE - 1) as f32 / 2.0;
    let col = (p[0] + 1.0) * scale;
    let row = (1.0 - p[1]) * scale;
    (row, col)
}

fn draw_disc(frame: &mut Array3<u8>, center: [f32; 2], radius: f32, color: [u8; 3]) {
    let (row, col) = to_pixel(center);
    let lo = |v: f32| (v - radius).floor().max(0.0) as usize;
    let hi = |v: f32| ((v + radius).ceil() as usize).min(FRAME_SIZE - 1);
    for r in lo(row)..=hi(row) {
        for c in lo(col)..=hi(col) {
            let dr = r as f32 - row;
            let dc = c as f32 - col;
            if dr * dr + dc * dc <= radius * radius {
                for (ch, &value) in color.iter().enumerate() {
                    frame[[r, c, ch]] = value;
                }
            }
        }
    }
}

impl Environment for PointReach {
    fn action_space(&self) -> DynSpace {
        DynSpace::Box(BoxSpace::symmetric(&[2]))
    }

    fn proprio_size(&self) -> Option<usize> {
        Some(4)
    }

    fn reset(&mut self) -> Result<Observation> {
        // Resample until the task is not already solved.
        loop {
            for i in 0..2 {
                self.position[i] = self.rng.gen_range(-0.9..0.9);
                self.target[i] = self.rng.gen_range(-0.9..0.9);
            }
            if self.distance() > 2.0 * self.reach_radius {
                break;
            }
        }
        self.velocity = [0.0; 2];
        self.started = true;
        Ok(self.observe())
    }

    fn step(&mut self, action: &[f32]) -> Result<StepResult> {
        if !self.started {
            return Err(VmailError::Data("PointReach stepped before reset".into()));
        }
        if action.len() != 2 {
            return Err(VmailError::ShapeMismatch {
                expected: vec![2],
                actual: vec![action.len() as i64],
            });
        }

        for i in 0..2 {
            let mut force = action[i].clamp(-1.0, 1.0) * self.force_scale;
            if let Some(noise) = &self.action_noise {
                force += noise.sample(&mut self.rng);
            }
            self.velocity[i] = self.damping * self.velocity[i] + self.dt * force;
            self.position[i] += self.dt * self.velocity[i];
            if self.position[i].abs() > 1.0 {
                self.position[i] = self.position[i].clamp(-1.0, 1.0);
                self.velocity[i] = 0.0;
            }
        }

        let distance = self.distance();
        let done = distance < self.reach_radius;
        if done {
            self.started = false;
        }
        Ok(StepResult {
            observation: self.observe(),
            reward: -distance,
            done,
            info: if done { EnvInfo::terminal() } else { EnvInfo::new() },
        })
    }
}
