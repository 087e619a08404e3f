//! Named values and the operands that reference them.
//!
//! Every value a program touches is declared once in the [`ValueTable`] with
//! a kind, a component count and optional binding data. Statements refer to
//! values through [`Operand`]s, which add a component selection and a sign.

use std::fmt;

use hashbrown::HashMap;

/// Handle of a value in a [`ValueTable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ValueId(pub u32);

impl ValueId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Storage kind of a named value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueKind {
    Temp,
    Input,
    Output,
    Param,
    Const,
    Texture,
}

impl ValueKind {
    pub fn name(self) -> &'static str {
        match self {
            ValueKind::Temp => "temp",
            ValueKind::Input => "input",
            ValueKind::Output => "output",
            ValueKind::Param => "param",
            ValueKind::Const => "const",
            ValueKind::Texture => "texture",
        }
    }
}

/// Hardware meaning attached to an input or output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SemanticKind {
    Position,
    Normal,
    Color,
    TexCoord,
    Fog,
    PointSize,
    Depth,
}

impl SemanticKind {
    pub fn name(self) -> &'static str {
        match self {
            SemanticKind::Position => "position",
            SemanticKind::Normal => "normal",
            SemanticKind::Color => "color",
            SemanticKind::TexCoord => "texcoord",
            SemanticKind::Fog => "fog",
            SemanticKind::PointSize => "pointsize",
            SemanticKind::Depth => "depth",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "position" => SemanticKind::Position,
            "normal" => SemanticKind::Normal,
            "color" => SemanticKind::Color,
            "texcoord" => SemanticKind::TexCoord,
            "fog" => SemanticKind::Fog,
            "pointsize" => SemanticKind::PointSize,
            "depth" => SemanticKind::Depth,
            _ => return None,
        })
    }
}

/// A semantic tag, optionally pinned to a slot (`texcoord3`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Semantic {
    pub kind: SemanticKind,
    pub index: Option<u8>,
}

impl Semantic {
    pub fn new(kind: SemanticKind) -> Self {
        Self { kind, index: None }
    }

    pub fn indexed(kind: SemanticKind, index: u8) -> Self {
        Self {
            kind,
            index: Some(index),
        }
    }

    /// Parse `color`, `texcoord`, `texcoord2` and the like.
    pub fn parse(text: &str) -> Option<Self> {
        let split = text
            .find(|c: char| c.is_ascii_digit())
            .unwrap_or(text.len());
        let kind = SemanticKind::from_name(&text[..split])?;
        if split == text.len() {
            return Some(Semantic::new(kind));
        }
        let index = text[split..].parse().ok()?;
        Some(Semantic::indexed(kind, index))
    }
}

impl fmt::Display for Semantic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.index {
            Some(idx) => write!(f, "{}{}", self.kind.name(), idx),
            None => f.write_str(self.kind.name()),
        }
    }
}

/// Texture target dimensionality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TextureDims {
    D1,
    D2,
    D3,
    Cube,
    Rect,
}

impl TextureDims {
    /// Target name as written in sampling instructions.
    pub fn target_name(self) -> &'static str {
        match self {
            TextureDims::D1 => "1D",
            TextureDims::D2 => "2D",
            TextureDims::D3 => "3D",
            TextureDims::Cube => "CUBE",
            TextureDims::Rect => "RECT",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name.to_ascii_lowercase().as_str() {
            "1d" => TextureDims::D1,
            "2d" => TextureDims::D2,
            "3d" => TextureDims::D3,
            "cube" => TextureDims::Cube,
            "rect" => TextureDims::Rect,
            _ => return None,
        })
    }

    /// Number of coordinate components a lookup reads.
    pub fn coord_size(self) -> u8 {
        match self {
            TextureDims::D1 => 1,
            TextureDims::D2 | TextureDims::Rect => 2,
            TextureDims::D3 | TextureDims::Cube => 3,
        }
    }
}

/// Shape of a texture value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TextureInfo {
    pub dims: TextureDims,
    /// Stored channels (1..=4).
    pub channels: u8,
    /// Width and height, used to scale integer lookups.
    pub extent: [u32; 2],
}

impl TextureInfo {
    pub fn new(dims: TextureDims, channels: u8) -> Self {
        Self {
            dims,
            channels,
            extent: [1, 1],
        }
    }

    pub fn with_extent(mut self, width: u32, height: u32) -> Self {
        self.extent = [width, height];
        self
    }
}

/// A declared value.
#[derive(Debug, Clone, PartialEq)]
pub struct Value {
    pub name: String,
    pub kind: ValueKind,
    /// Component count, 1..=4.
    pub size: u8,
    pub semantic: Option<Semantic>,
    /// Initial contents for parameters and constants.
    pub data: Option<Vec<f32>>,
    pub texture: Option<TextureInfo>,
    /// Half precision is sufficient.
    pub half: bool,
}

impl Value {
    fn new(name: &str, kind: ValueKind, size: u8) -> Self {
        assert!((1..=4).contains(&size), "value {} has size {}", name, size);
        Self {
            name: name.to_string(),
            kind,
            size,
            semantic: None,
            data: None,
            texture: None,
            half: false,
        }
    }

    pub fn temp(name: &str, size: u8) -> Self {
        Self::new(name, ValueKind::Temp, size)
    }

    pub fn input(name: &str, size: u8) -> Self {
        Self::new(name, ValueKind::Input, size)
    }

    pub fn output(name: &str, size: u8) -> Self {
        Self::new(name, ValueKind::Output, size)
    }

    pub fn param(name: &str, data: &[f32]) -> Self {
        let mut value = Self::new(name, ValueKind::Param, data.len() as u8);
        value.data = Some(data.to_vec());
        value
    }

    pub fn constant(name: &str, data: &[f32]) -> Self {
        let mut value = Self::new(name, ValueKind::Const, data.len() as u8);
        value.data = Some(data.to_vec());
        value
    }

    pub fn texture(name: &str, info: TextureInfo) -> Self {
        let mut value = Self::new(name, ValueKind::Texture, info.channels);
        value.texture = Some(info);
        value
    }

    pub fn with_semantic(mut self, semantic: Semantic) -> Self {
        self.semantic = Some(semantic);
        self
    }

    pub fn with_half(mut self) -> Self {
        self.half = true;
        self
    }
}

/// Component selection: up to four source components, each 0..=3.
///
/// On a destination the same type is the write mask.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Swizzle {
    comps: [u8; 4],
    len: u8,
}

impl Swizzle {
    pub fn new(comps: &[u8]) -> Self {
        assert!(
            (1..=4).contains(&comps.len()) && comps.iter().all(|c| *c < 4),
            "invalid swizzle {:?}",
            comps
        );
        let mut buf = [0u8; 4];
        buf[..comps.len()].copy_from_slice(comps);
        Self {
            comps: buf,
            len: comps.len() as u8,
        }
    }

    /// `xyzw` truncated to `size` components.
    pub fn identity(size: u8) -> Self {
        Self::new(&[0, 1, 2, 3][..size as usize])
    }

    /// One component repeated `size` times.
    pub fn splat(comp: u8, size: u8) -> Self {
        Self::new(&[comp; 4][..size as usize])
    }

    /// Parse `xyzw`/`rgba` letters.
    pub fn parse(text: &str) -> Option<Self> {
        if text.is_empty() || text.len() > 4 {
            return None;
        }
        let mut comps = Vec::with_capacity(4);
        for ch in text.chars() {
            comps.push(match ch {
                'x' | 'r' => 0,
                'y' | 'g' => 1,
                'z' | 'b' => 2,
                'w' | 'a' => 3,
                _ => return None,
            });
        }
        Some(Self::new(&comps))
    }

    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn comps(&self) -> &[u8] {
        &self.comps[..self.len as usize]
    }

    pub fn get(&self, i: usize) -> u8 {
        self.comps()[i]
    }

    pub fn is_identity(&self, size: u8) -> bool {
        self.len == size && self.comps().iter().enumerate().all(|(i, c)| *c as usize == i)
    }

    /// Selection equivalent to applying `self` to the result of `inner`.
    pub fn compose(&self, inner: &Swizzle) -> Swizzle {
        let comps: Vec<u8> = self.comps().iter().map(|c| inner.get(*c as usize)).collect();
        Swizzle::new(&comps)
    }

    /// All components distinct, as required of a write mask.
    pub fn is_mask(&self) -> bool {
        let comps = self.comps();
        comps
            .iter()
            .enumerate()
            .all(|(i, c)| !comps[..i].contains(c))
    }
}

impl fmt::Debug for Swizzle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Swizzle({})", self)
    }
}

impl fmt::Display for Swizzle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for c in self.comps() {
            f.write_str(["x", "y", "z", "w"][*c as usize])?;
        }
        Ok(())
    }
}

/// Reference to a value with component selection and sign.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Operand {
    pub value: ValueId,
    pub swizzle: Swizzle,
    pub neg: bool,
}

impl Operand {
    pub fn new(value: ValueId, swizzle: Swizzle) -> Self {
        Self {
            value,
            swizzle,
            neg: false,
        }
    }

    pub fn size(&self) -> u8 {
        self.swizzle.len() as u8
    }

    pub fn negated(mut self) -> Self {
        self.neg = !self.neg;
        self
    }

    /// Further select components of this operand.
    pub fn select(mut self, comps: &[u8]) -> Self {
        self.swizzle = Swizzle::new(comps).compose(&self.swizzle);
        self
    }
}

/// All values declared by a program.
#[derive(Debug, Clone, Default)]
pub struct ValueTable {
    values: Vec<Value>,
    by_name: HashMap<String, ValueId>,
}

impl ValueTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a value. Names are unique within a program.
    pub fn add(&mut self, value: Value) -> ValueId {
        assert!(
            !self.by_name.contains_key(&value.name),
            "value {} declared twice",
            value.name
        );
        let id = ValueId(self.values.len() as u32);
        self.by_name.insert(value.name.clone(), id);
        self.values.push(value);
        id
    }

    pub fn get(&self, id: ValueId) -> &Value {
        &self.values[id.index()]
    }

    pub fn get_mut(&mut self, id: ValueId) -> &mut Value {
        &mut self.values[id.index()]
    }

    pub fn lookup(&self, name: &str) -> Option<ValueId> {
        self.by_name.get(name).copied()
    }

    /// Operand covering every component of `id`.
    pub fn operand(&self, id: ValueId) -> Operand {
        Operand::new(id, Swizzle::identity(self.get(id).size))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (ValueId, &Value)> {
        self.values
            .iter()
            .enumerate()
            .map(|(i, v)| (ValueId(i as u32), v))
    }

    /// Values of one kind in declaration order.
    pub fn of_kind(&self, kind: ValueKind) -> impl Iterator<Item = (ValueId, &Value)> {
        self.iter().filter(move |(_, v)| v.kind == kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_swizzle_parse_and_compose() {
        let zyx = Swizzle::parse("zyx").unwrap();
        assert_eq!(zyx.comps(), &[2, 1, 0]);
        assert_eq!(Swizzle::parse("rgba").unwrap(), Swizzle::identity(4));
        assert!(Swizzle::parse("xq").is_none());

        let outer = Swizzle::parse("yy").unwrap();
        assert_eq!(outer.compose(&zyx).to_string(), "yy");
        let outer = Swizzle::parse("xz").unwrap();
        assert_eq!(outer.compose(&zyx).to_string(), "zx");
    }

    #[test]
    fn test_swizzle_identity_and_mask() {
        assert!(Swizzle::identity(3).is_identity(3));
        assert!(!Swizzle::identity(3).is_identity(4));
        assert!(Swizzle::parse("wx").unwrap().is_mask());
        assert!(!Swizzle::parse("xx").unwrap().is_mask());
    }

    #[test]
    fn test_semantic_parse() {
        assert_eq!(
            Semantic::parse("texcoord3"),
            Some(Semantic::indexed(SemanticKind::TexCoord, 3))
        );
        assert_eq!(
            Semantic::parse("color"),
            Some(Semantic::new(SemanticKind::Color))
        );
        assert_eq!(Semantic::parse("bogus"), None);
    }

    #[test]
    fn test_value_table_lookup() {
        let mut values = ValueTable::new();
        let a = values.add(Value::input("a", 3));
        let k = values.add(Value::constant("k", &[0.5]));
        assert_eq!(values.lookup("a"), Some(a));
        assert_eq!(values.get(k).size, 1);
        assert_eq!(values.operand(a).swizzle, Swizzle::identity(3));
        assert_eq!(values.of_kind(ValueKind::Const).count(), 1);
    }

    #[test]
    #[should_panic(expected = "declared twice")]
    fn test_duplicate_value_panics() {
        let mut values = ValueTable::new();
        values.add(Value::temp("t", 1));
        values.add(Value::temp("t", 2));
    }
}
