//! Turtle-space geometry: positions, facings, poses, and the bounding box.
//!
//! Turtle-space is a right-handed integer frame rooted at the calibrated
//! spawn-column floor cell. `y` is vertical. Facings are quarter turns:
//! 0 = +z, 1 = +x, 2 = -z, 3 = -x.

use serde::{Deserialize, Serialize};

/// An integer cell position in turtle-space.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct Pos {
    pub x: i32,
    pub y: i32,
    pub z: i32,
}

impl Pos {
    pub const fn new(x: i32, y: i32, z: i32) -> Self {
        Self { x, y, z }
    }

    /// The spawn-column floor cell.
    pub const ORIGIN: Pos = Pos::new(0, 0, 0);

    pub fn offset(self, dx: i32, dy: i32, dz: i32) -> Self {
        Self::new(self.x + dx, self.y + dy, self.z + dz)
    }

    /// Manhattan distance, used for worst-case fuel accounting.
    pub fn manhattan(self, other: Pos) -> u64 {
        let d = |a: i32, b: i32| (a - b).unsigned_abs() as u64;
        d(self.x, other.x) + d(self.y, other.y) + d(self.z, other.z)
    }

    /// The six face-adjacent neighbours, in a fixed order.
    pub fn neighbours(self) -> [Pos; 6] {
        [
            self.offset(1, 0, 0),
            self.offset(-1, 0, 0),
            self.offset(0, 1, 0),
            self.offset(0, -1, 0),
            self.offset(0, 0, 1),
            self.offset(0, 0, -1),
        ]
    }
}

impl std::fmt::Display for Pos {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({},{},{})", self.x, self.y, self.z)
    }
}

/// A cardinal facing as a quarter-turn index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dir {
    /// +z
    PosZ,
    /// +x
    PosX,
    /// -z
    NegZ,
    /// -x
    NegX,
}

impl Default for Dir {
    fn default() -> Self {
        Dir::PosZ
    }
}

impl Dir {
    pub fn index(self) -> u8 {
        match self {
            Dir::PosZ => 0,
            Dir::PosX => 1,
            Dir::NegZ => 2,
            Dir::NegX => 3,
        }
    }

    pub fn from_index(i: u8) -> Self {
        match i % 4 {
            0 => Dir::PosZ,
            1 => Dir::PosX,
            2 => Dir::NegZ,
            _ => Dir::NegX,
        }
    }

    pub fn right(self) -> Self {
        Self::from_index(self.index() + 1)
    }

    pub fn left(self) -> Self {
        Self::from_index(self.index() + 3)
    }

    pub fn opposite(self) -> Self {
        Self::from_index(self.index() + 2)
    }

    /// The horizontal unit step for this facing.
    pub fn step(self) -> Pos {
        match self {
            Dir::PosZ => Pos::new(0, 0, 1),
            Dir::PosX => Pos::new(1, 0, 0),
            Dir::NegZ => Pos::new(0, 0, -1),
            Dir::NegX => Pos::new(-1, 0, 0),
        }
    }

    /// Facing that walks from `from` toward `to` along the given horizontal
    /// axis, if the coordinates differ on it.
    pub fn toward_x(from: Pos, to: Pos) -> Option<Dir> {
        match to.x.cmp(&from.x) {
            std::cmp::Ordering::Greater => Some(Dir::PosX),
            std::cmp::Ordering::Less => Some(Dir::NegX),
            std::cmp::Ordering::Equal => None,
        }
    }

    pub fn toward_z(from: Pos, to: Pos) -> Option<Dir> {
        match to.z.cmp(&from.z) {
            std::cmp::Ordering::Greater => Some(Dir::PosZ),
            std::cmp::Ordering::Less => Some(Dir::NegZ),
            std::cmp::Ordering::Equal => None,
        }
    }
}

/// An agent's position and facing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Pose {
    pub pos: Pos,
    pub dir: Dir,
}

impl Pose {
    pub fn new(pos: Pos, dir: Dir) -> Self {
        Self { pos, dir }
    }

    /// The cell one step ahead of this pose.
    pub fn ahead(&self) -> Pos {
        let d = self.dir.step();
        self.pos.offset(d.x, d.y, d.z)
    }

    pub fn above(&self) -> Pos {
        self.pos.offset(0, 1, 0)
    }

    pub fn below(&self) -> Pos {
        self.pos.offset(0, -1, 0)
    }
}

impl std::fmt::Display for Pose {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{:?}", self.pos, self.dir)
    }
}

/// The axis-aligned region agents may enter: `[0..max_x]×[0..max_y]×[0..max_z]`
/// inclusive. Immutable within a configuration version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub max_x: i32,
    pub max_y: i32,
    pub max_z: i32,
}

impl BoundingBox {
    pub fn new(max_x: i32, max_y: i32, max_z: i32) -> Self {
        Self {
            max_x,
            max_y,
            max_z,
        }
    }

    pub fn contains(&self, p: Pos) -> bool {
        (0..=self.max_x).contains(&p.x)
            && (0..=self.max_y).contains(&p.y)
            && (0..=self.max_z).contains(&p.z)
    }
}

impl Default for BoundingBox {
    fn default() -> Self {
        Self::new(8, 6, 16)
    }
}
