use std::fmt;

/// One of the two opposed needle beds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Bed {
    Front,
    Back,
}

impl Bed {
    pub fn opposite(self) -> Bed {
        match self {
            Bed::Front => Bed::Back,
            Bed::Back => Bed::Front,
        }
    }

    pub fn is_front(self) -> bool {
        self == Bed::Front
    }

    /// Parse the bed vocabulary accepted in patterns (`Front`, `back bed`, ...).
    pub fn from_name(name: &str) -> Option<Bed> {
        let lowered = name.to_ascii_lowercase().replace('_', " ");
        match lowered.trim_end_matches(" bed") {
            "front" => Some(Bed::Front),
            "back" => Some(Bed::Back),
            _ => None,
        }
    }
}

impl fmt::Display for Bed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Bed::Front => f.write_str("Front"),
            Bed::Back => f.write_str("Back"),
        }
    }
}

/// A physical needle (or its slider) on the machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Needle {
    pub bed: Bed,
    pub position: i32,
    pub is_slider: bool,
}

impl Needle {
    pub fn new(bed: Bed, position: i32) -> Self {
        Self {
            bed,
            position,
            is_slider: false,
        }
    }

    pub fn front(position: i32) -> Self {
        Self::new(Bed::Front, position)
    }

    pub fn back(position: i32) -> Self {
        Self::new(Bed::Back, position)
    }

    pub fn slider(bed: Bed, position: i32) -> Self {
        Self {
            bed,
            position,
            is_slider: true,
        }
    }

    pub fn is_front(&self) -> bool {
        self.bed.is_front()
    }

    pub fn is_back(&self) -> bool {
        !self.bed.is_front()
    }

    /// Same position and slider bit on the other bed.
    pub fn opposite(&self) -> Needle {
        Needle {
            bed: self.bed.opposite(),
            ..*self
        }
    }

    pub fn main_needle(&self) -> Needle {
        Needle {
            is_slider: false,
            ..*self
        }
    }

    pub fn with_slider(&self, is_slider: bool) -> Needle {
        Needle { is_slider, ..*self }
    }

    /// `None` when the new position does not fit in an `i32`.
    pub fn offset(&self, delta: i32) -> Option<Needle> {
        Some(Needle {
            position: self.position.checked_add(delta)?,
            ..*self
        })
    }

    /// Position on the front-bed axis at the given integer racking.
    pub fn racked_position_on_front(&self, rack: i32) -> i32 {
        match self.bed {
            Bed::Front => self.position,
            Bed::Back => self.position + rack,
        }
    }

    /// Parse `f12`, `b3`, `fs0`, `bs7`.
    pub fn parse(text: &str) -> Option<Needle> {
        let (bed, rest) = if let Some(rest) = text.strip_prefix('f') {
            (Bed::Front, rest)
        } else if let Some(rest) = text.strip_prefix('b') {
            (Bed::Back, rest)
        } else {
            return None;
        };
        let (is_slider, digits) = match rest.strip_prefix('s') {
            Some(d) => (true, d),
            None => (false, rest),
        };
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        let position = digits.parse().ok()?;
        Some(Needle {
            bed,
            position,
            is_slider,
        })
    }
}

impl fmt::Display for Needle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bed = if self.is_front() { "f" } else { "b" };
        let slider = if self.is_slider { "s" } else { "" };
        write!(f, "{bed}{slider}{}", self.position)
    }
}

/// A needle addressed by sheet coordinates. Physical position is
/// `sheet_pos * gauge + sheet`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SheetNeedle {
    pub bed: Bed,
    pub sheet_pos: i32,
    pub sheet: i32,
    pub gauge: i32,
    pub is_slider: bool,
}

impl SheetNeedle {
    pub fn new(bed: Bed, sheet_pos: i32, sheet: i32, gauge: i32) -> Self {
        Self {
            bed,
            sheet_pos,
            sheet,
            gauge,
            is_slider: false,
        }
    }

    pub fn from_needle(needle: Needle, gauge: i32) -> Self {
        let gauge = gauge.max(1);
        Self {
            bed: needle.bed,
            sheet_pos: needle.position.div_euclid(gauge),
            sheet: needle.position.rem_euclid(gauge),
            gauge,
            is_slider: needle.is_slider,
        }
    }

    pub fn position(&self) -> i32 {
        self.sheet_pos * self.gauge + self.sheet
    }

    pub fn needle(&self) -> Needle {
        Needle {
            bed: self.bed,
            position: self.position(),
            is_slider: self.is_slider,
        }
    }

    /// The needle at the same sheet position on another sheet.
    pub fn on_sheet(&self, sheet: i32) -> SheetNeedle {
        SheetNeedle { sheet, ..*self }
    }
}

/// A sheet number paired with the gauge it belongs to (`s1:g2`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SheetIdentifier {
    pub sheet: i32,
    pub gauge: i32,
}

impl SheetIdentifier {
    pub fn new(sheet: i32, gauge: i32) -> Self {
        Self { sheet, gauge }
    }

    /// Physical needle for the sheet-local position `sheet_pos`, or `None`
    /// when that position does not fit in an `i32`.
    pub fn get_needle(&self, bed: Bed, sheet_pos: i32, is_slider: bool) -> Option<Needle> {
        let position = sheet_pos.checked_mul(self.gauge)?.checked_add(self.sheet)?;
        Some(Needle {
            bed,
            position,
            is_slider,
        })
    }

    /// Parse `s1`, `s1:g2`.
    pub fn parse(text: &str, default_gauge: i32) -> Option<SheetIdentifier> {
        let rest = text.strip_prefix('s')?;
        let (sheet, gauge) = match rest.split_once(':') {
            Some((s, g)) => (s, Some(g.strip_prefix('g')?)),
            None => (rest, None),
        };
        let sheet = sheet.parse().ok()?;
        let gauge = match gauge {
            Some(g) => g.parse().ok()?,
            None => default_gauge,
        };
        Some(SheetIdentifier { sheet, gauge })
    }
}

impl fmt::Display for SheetIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s{}:g{}", self.sheet, self.gauge)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn parse_and_display() {
        for text in ["f0", "b12", "fs3", "bs40"] {
            assert_eq!(Needle::parse(text).unwrap().to_string(), text);
        }
        assert!(Needle::parse("x3").is_none());
        assert!(Needle::parse("f").is_none());
        assert!(Needle::parse("fsx").is_none());
    }

    #[test]
    fn opposite_keeps_slider_bit() {
        let n = Needle::slider(Bed::Front, 4);
        assert_eq!(n.opposite(), Needle::slider(Bed::Back, 4));
        assert_eq!(n.opposite().opposite(), n);
    }

    #[test]
    fn racked_position_shifts_back_bed() {
        assert_eq!(Needle::front(5).racked_position_on_front(1), 5);
        assert_eq!(Needle::back(5).racked_position_on_front(1), 6);
        assert_eq!(Needle::back(5).racked_position_on_front(-2), 3);
    }

    #[test]
    fn sheet_needle_mapping() {
        let sn = SheetNeedle::new(Bed::Front, 5, 1, 2);
        assert_eq!(sn.position(), 11);
        let back = SheetNeedle::from_needle(Needle::back(11), 2);
        assert_eq!((back.sheet_pos, back.sheet), (5, 1));
        assert_eq!(back.on_sheet(0).position(), 10);
    }

    #[test]
    fn sheet_identifier_parse() {
        assert_eq!(SheetIdentifier::parse("s1", 3), Some(SheetIdentifier::new(1, 3)));
        assert_eq!(SheetIdentifier::parse("s1:g2", 3), Some(SheetIdentifier::new(1, 2)));
        assert_eq!(SheetIdentifier::new(1, 2).to_string(), "s1:g2");
        assert_eq!(SheetIdentifier::new(1, 2).get_needle(Bed::Back, 3, false), Some(Needle::back(7)));
        assert_eq!(SheetIdentifier::new(1, 2).get_needle(Bed::Front, i32::MAX / 2 + 1, false), None);
    }

    #[test]
    fn bed_names() {
        assert_eq!(Bed::from_name("Front"), Some(Bed::Front));
        assert_eq!(Bed::from_name("back bed"), Some(Bed::Back));
        assert_eq!(Bed::from_name("Back_Bed"), Some(Bed::Back));
        assert_eq!(Bed::from_name("side"), None);
    }
}
