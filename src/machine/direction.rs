use std::cmp::Ordering;
use std::fmt;

use super::needle::Needle;

/// Carriage pass direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Leftward,
    Rightward,
}

impl Direction {
    pub fn opposite(self) -> Direction {
        match self {
            Direction::Leftward => Direction::Rightward,
            Direction::Rightward => Direction::Leftward,
        }
    }

    /// Knitout symbol: `-` for leftward, `+` for rightward.
    pub fn symbol(self) -> &'static str {
        match self {
            Direction::Leftward => "-",
            Direction::Rightward => "+",
        }
    }

    pub fn from_symbol(symbol: &str) -> Option<Direction> {
        match symbol {
            "-" => Some(Direction::Leftward),
            "+" => Some(Direction::Rightward),
            _ => None,
        }
    }

    /// Order two needles for a pass in this direction. Racked positions
    /// ascend for rightward passes and descend for leftward ones; at equal
    /// racked positions the front needle comes first.
    pub fn compare(self, a: &Needle, b: &Needle, rack: i32) -> Ordering {
        let pa = a.racked_position_on_front(rack);
        let pb = b.racked_position_on_front(rack);
        let by_position = match self {
            Direction::Rightward => pa.cmp(&pb),
            Direction::Leftward => pb.cmp(&pa),
        };
        by_position
            .then_with(|| b.is_front().cmp(&a.is_front()))
            .then_with(|| a.is_slider.cmp(&b.is_slider))
    }

    pub fn sort_needles(self, needles: &mut [Needle], rack: i32) {
        needles.sort_by(|a, b| self.compare(a, b, rack));
    }

    pub fn sorted_needles(self, needles: impl IntoIterator<Item = Needle>, rack: i32) -> Vec<Needle> {
        let mut sorted: Vec<Needle> = needles.into_iter().collect();
        self.sort_needles(&mut sorted, rack);
        sorted
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Leftward => f.write_str("Leftward"),
            Direction::Rightward => f.write_str("Rightward"),
        }
    }
}
