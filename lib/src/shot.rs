//! Ball launch parameters and the speed/spin <-> motor RPM physics.
//!
//! The robot is driven by raw top/bottom wheel RPMs. The editor works in
//! physics units (speed 0-10, spin 0-10, rotation) and derives RPMs from
//! them; drills loaded without cached physics get them back through
//! `reverse_calculate`.

use std::fmt;

use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};

pub const MIN_RPM: i32 = 400;
pub const MAX_RPM: i32 = 7500;
pub const MIN_HEIGHT: i32 = -50;
pub const MAX_HEIGHT: i32 = 100;
pub const MIN_DROP: f64 = -10.0;
pub const MAX_DROP: f64 = 10.0;
pub const MIN_FREQ: i32 = 0;
pub const MAX_FREQ: i32 = 100;
pub const MIN_REPS: u32 = 1;
pub const MAX_REPS: u32 = 200;

/// Granularity of the drop/curve axis.
pub const DROP_STEP: f64 = 0.5;

const BASE_RPM: f64 = 970.0;
const RPM_PER_SPEED: f64 = 630.5;
const RPM_PER_SPIN: f64 = 342.0;

/// Largest spin that keeps both wheels inside [MIN_RPM, MAX_RPM], indexed by
/// integer speed, rounded down to half steps.
const MAX_SPIN_BY_SPEED: [f64; 11] = [1.5, 3.5, 5.0, 7.0, 9.0, 9.5, 8.0, 6.0, 4.0, 2.5, 0.5];

// ---------------------------------------------------------------------------
// Physics
// ---------------------------------------------------------------------------

/// Which wheel spins faster.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Rotation {
    #[default]
    #[serde(alias = "top")]
    TopSpin,
    #[serde(alias = "back")]
    BackSpin,
}

impl fmt::Display for Rotation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TopSpin => write!(f, "top"),
            Self::BackSpin => write!(f, "back"),
        }
    }
}

/// Editor-level description of a ball.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ShotPhysics {
    pub speed: f64,
    pub spin: f64,
    #[serde(default)]
    pub rotation: Rotation,
}

impl ShotPhysics {
    pub fn new(speed: f64, spin: f64, rotation: Rotation) -> Self {
        let speed = speed.clamp(0.0, 10.0);
        let spin = spin.clamp(0.0, max_spin(speed));
        Self {
            speed,
            spin,
            rotation,
        }
    }
}

/// Maximum spin for a speed. Fractional speeds take the tighter of the two
/// neighbouring table entries.
pub fn max_spin(speed: f64) -> f64 {
    let speed = speed.clamp(0.0, 10.0);
    let lo = speed.floor() as usize;
    let hi = speed.ceil() as usize;
    MAX_SPIN_BY_SPEED[lo].min(MAX_SPIN_BY_SPEED[hi])
}

pub fn clamp_rpm(rpm: i32) -> u32 {
    rpm.clamp(MIN_RPM, MAX_RPM) as u32
}

/// Derive (top, bottom) wheel RPMs from physics inputs.
pub fn calculate_rpms(physics: &ShotPhysics) -> (u32, u32) {
    let base = BASE_RPM + RPM_PER_SPEED * physics.speed;
    let offset = RPM_PER_SPIN * physics.spin;
    let (top, bottom) = match physics.rotation {
        Rotation::TopSpin => (base + offset, base - offset),
        Rotation::BackSpin => (base - offset, base + offset),
    };
    (
        clamp_rpm(top.round() as i32),
        clamp_rpm(bottom.round() as i32),
    )
}

/// Recover physics inputs from raw wheel RPMs.
pub fn reverse_calculate(top: u32, bottom: u32) -> ShotPhysics {
    let (top, bottom) = (top as f64, bottom as f64);
    let base = (top + bottom) / 2.0;
    let offset = (top - bottom).abs() / 2.0;
    ShotPhysics {
        speed: (base - BASE_RPM) / RPM_PER_SPEED,
        spin: offset / RPM_PER_SPIN,
        rotation: if bottom > top {
            Rotation::BackSpin
        } else {
            Rotation::TopSpin
        },
    }
}

// ---------------------------------------------------------------------------
// ShotParameters
// ---------------------------------------------------------------------------

/// One physical ball launch.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ShotParameters {
    pub top: i32,
    pub bottom: i32,
    pub height: i32,
    pub drop: f64,
    pub freq: i32,
    pub reps: u32,
    pub active: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub physics: Option<ShotPhysics>,
}

impl ShotParameters {
    pub fn new(top: i32, bottom: i32, height: i32, drop: f64, freq: i32, reps: u32) -> Self {
        Self {
            top,
            bottom,
            height,
            drop,
            freq,
            reps,
            active: true,
            physics: None,
        }
    }

    /// Build from physics inputs, caching them for later display.
    pub fn from_physics(physics: ShotPhysics, height: i32, drop: f64, freq: i32, reps: u32) -> Self {
        let physics = ShotPhysics::new(physics.speed, physics.spin, physics.rotation);
        let (top, bottom) = calculate_rpms(&physics);
        Self {
            physics: Some(physics),
            ..Self::new(top as i32, bottom as i32, height, drop, freq, reps)
        }
    }

    pub fn display_physics(&self) -> ShotPhysics {
        self.physics
            .unwrap_or_else(|| reverse_calculate(clamp_rpm(self.top), clamp_rpm(self.bottom)))
    }

    /// Single test ball: same trajectory, fixed cadence, fired once.
    pub fn test_fire(&self) -> Self {
        Self {
            freq: 50,
            reps: 1,
            ..self.clone()
        }
    }

    /// Same shot with a different drop value, clamped into range.
    pub fn with_drop(&self, drop: f64) -> Self {
        Self {
            drop: drop.clamp(MIN_DROP, MAX_DROP),
            ..self.clone()
        }
    }
}

// ---------------------------------------------------------------------------
// Deserialization: structured object or compact legacy array
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
#[serde(untagged)]
enum ShotRepr {
    Compact(Vec<CompactField>),
    Full(ShotFields),
}

#[derive(Deserialize)]
#[serde(untagged)]
enum CompactField {
    Number(f64),
    Text(String),
}

#[derive(Deserialize)]
struct ShotFields {
    top: i32,
    bottom: i32,
    #[serde(default)]
    height: i32,
    #[serde(default)]
    drop: f64,
    #[serde(default)]
    freq: i32,
    #[serde(default = "one")]
    reps: u32,
    #[serde(default = "active_default", deserialize_with = "deserialize_flag")]
    active: bool,
    #[serde(default)]
    physics: Option<ShotPhysics>,
}

fn one() -> u32 {
    1
}

fn active_default() -> bool {
    true
}

#[derive(Debug)]
struct ShotFormatError(String);

impl fmt::Display for ShotFormatError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid shot: {}", self.0)
    }
}

impl<'de> Deserialize<'de> for ShotParameters {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        match ShotRepr::deserialize(deserializer)? {
            ShotRepr::Full(f) => Ok(Self {
                top: f.top,
                bottom: f.bottom,
                height: f.height,
                drop: f.drop,
                freq: f.freq,
                reps: f.reps,
                active: f.active,
                physics: f.physics.map(|p| ShotPhysics::new(p.speed, p.spin, p.rotation)),
            }),
            ShotRepr::Compact(fields) => from_compact(&fields).map_err(de::Error::custom),
        }
    }
}

/// `[top, bottom, height, drop, freq, reps, active?, speed?, spin?, "top"|"back"?]`
fn from_compact(fields: &[CompactField]) -> Result<ShotParameters, ShotFormatError> {
    let num = |i: usize| match fields.get(i) {
        Some(CompactField::Number(n)) => Ok(Some(*n)),
        Some(CompactField::Text(s)) => Err(ShotFormatError(format!("field {i} is text {s:?}"))),
        None => Ok(None),
    };
    let required = |i: usize| {
        num(i)?.ok_or_else(|| ShotFormatError(format!("expected at least 6 fields, got {}", fields.len())))
    };

    let mut shot = ShotParameters::new(
        required(0)? as i32,
        required(1)? as i32,
        required(2)? as i32,
        required(3)?,
        required(4)? as i32,
        (required(5)? as u32).max(MIN_REPS),
    );
    shot.active = num(6)?.is_none_or(|a| a != 0.0);

    if let (Some(speed), Some(spin)) = (num(7)?, num(8)?) {
        let rotation = match fields.get(9) {
            Some(CompactField::Text(t)) if t == "back" => Rotation::BackSpin,
            _ => Rotation::TopSpin,
        };
        shot.physics = Some(ShotPhysics::new(speed, spin, rotation));
    }
    Ok(shot)
}

/// Accepts `true`/`false` as well as the legacy `1`/`0`.
pub(crate) fn deserialize_flag<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Flag {
        Bool(bool),
        Number(f64),
    }
    match Flag::deserialize(deserializer) {
        Ok(Flag::Bool(b)) => Ok(b),
        Ok(Flag::Number(n)) => Ok(n != 0.0),
        Err(_) => Err(de::Error::custom("expected boolean or 0/1")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rpms_clamp_into_motor_range() {
        let physics = ShotPhysics {
            speed: 10.0,
            spin: 10.0,
            rotation: Rotation::TopSpin,
        };
        let (top, bottom) = calculate_rpms(&physics);
        assert_eq!(top, 7500);
        assert_eq!(bottom, 3855);
    }

    #[test]
    fn backspin_swaps_wheels() {
        let top = calculate_rpms(&ShotPhysics::new(4.0, 3.0, Rotation::TopSpin));
        let back = calculate_rpms(&ShotPhysics::new(4.0, 3.0, Rotation::BackSpin));
        assert_eq!(top, (back.1, back.0));
        assert!(back.1 > back.0);
    }

    #[test]
    fn physics_round_trip_within_table() {
        for speed in 0..=10 {
            let speed = speed as f64;
            let mut spin = 0.5;
            while spin <= max_spin(speed) {
                for rotation in [Rotation::TopSpin, Rotation::BackSpin] {
                    let input = ShotPhysics::new(speed, spin, rotation);
                    let (top, bottom) = calculate_rpms(&input);
                    let back = reverse_calculate(top, bottom);
                    assert!((back.speed - speed).abs() <= 0.5, "speed {speed} spin {spin}");
                    assert!((back.spin - spin).abs() <= 0.5, "speed {speed} spin {spin}");
                    assert_eq!(back.rotation, rotation);
                }
                spin += 0.5;
            }
        }
    }

    #[test]
    fn fractional_speed_uses_tighter_neighbour() {
        assert_eq!(max_spin(4.5), 9.0);
        assert_eq!(max_spin(9.5), 0.5);
        assert_eq!(ShotPhysics::new(10.0, 3.0, Rotation::TopSpin).spin, 0.5);
    }

    #[test]
    fn parses_compact_array_with_physics() {
        let shot: ShotParameters =
            serde_json::from_str(r#"[4123, 2233, 50, 0, 50, 1, 1, 5, 2, "top"]"#).unwrap();
        assert_eq!(shot.top, 4123);
        assert_eq!(shot.bottom, 2233);
        assert!(shot.active);
        assert_eq!(
            shot.physics,
            Some(ShotPhysics {
                speed: 5.0,
                spin: 2.0,
                rotation: Rotation::TopSpin
            })
        );
    }

    #[test]
    fn loaded_physics_is_clamped_to_speed_table() {
        let shot: ShotParameters =
            serde_json::from_str(r#"[7500, 7000, 50, 0, 50, 1, 1, 10, 10, "top"]"#).unwrap();
        let p = shot.physics.unwrap();
        assert_eq!(p.speed, 10.0);
        assert!(p.spin <= max_spin(p.speed));

        let shot: ShotParameters = serde_json::from_str(
            r#"{"top": 7500, "bottom": 7000, "physics": {"speed": 12, "spin": 9, "rotation": "back"}}"#,
        )
        .unwrap();
        let p = shot.physics.unwrap();
        assert_eq!(p.speed, 10.0);
        assert_eq!(p.spin, 0.5);
        assert_eq!(p.rotation, Rotation::BackSpin);
    }

    #[test]
    fn compact_active_zero_is_inactive() {
        let shot: ShotParameters = serde_json::from_str("[1547, 2915, 50, -5, 10, 1, 0]").unwrap();
        assert!(!shot.active);
        assert!(shot.physics.is_none());
    }

    #[test]
    fn short_compact_array_is_rejected() {
        assert!(serde_json::from_str::<ShotParameters>("[1547, 2915, 50]").is_err());
    }

    #[test]
    fn structured_form_accepts_numeric_flag() {
        let shot: ShotParameters =
            serde_json::from_str(r#"{"top": 3000, "bottom": 2000, "active": 0}"#).unwrap();
        assert!(!shot.active);
        assert_eq!(shot.reps, 1);
    }

    #[test]
    fn display_physics_prefers_cached_inputs() {
        let cached = ShotParameters::from_physics(ShotPhysics::new(3.0, 2.0, Rotation::BackSpin), 0, 0.0, 10, 1);
        assert_eq!(cached.display_physics().spin, 2.0);

        let raw = ShotParameters::new(1547, 2915, 50, -5.0, 10, 1);
        assert_eq!(raw.display_physics().rotation, Rotation::BackSpin);
    }
}
