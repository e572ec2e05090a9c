// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Data descriptors: what a signal's samples look like.

use std::fmt;

/// Sample type of a signal value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SampleType {
    Float32,
    Float64,
    Int8,
    Int16,
    Int32,
    Int64,
    UInt8,
    UInt16,
    UInt32,
    UInt64,
    ComplexFloat32,
    ComplexFloat64,
    Struct,
    Binary,
    String,
    Undefined,
}

impl SampleType {
    /// Name used in the `signal` metadata, `None` when not streamable.
    pub fn wire_name(self) -> Option<&'static str> {
        match self {
            SampleType::Float32 => Some("real32"),
            SampleType::Float64 => Some("real64"),
            SampleType::Int8 => Some("int8"),
            SampleType::Int16 => Some("int16"),
            SampleType::Int32 => Some("int32"),
            SampleType::Int64 => Some("int64"),
            SampleType::UInt8 => Some("uint8"),
            SampleType::UInt16 => Some("uint16"),
            SampleType::UInt32 => Some("uint32"),
            SampleType::UInt64 => Some("uint64"),
            SampleType::ComplexFloat32 => Some("complex32"),
            SampleType::ComplexFloat64 => Some("complex64"),
            SampleType::Struct => Some("struct"),
            SampleType::Binary | SampleType::String | SampleType::Undefined => None,
        }
    }

    /// Inverse of [`SampleType::wire_name`].
    pub fn from_wire_name(name: &str) -> Option<Self> {
        Some(match name {
            "real32" => SampleType::Float32,
            "real64" => SampleType::Float64,
            "int8" => SampleType::Int8,
            "int16" => SampleType::Int16,
            "int32" => SampleType::Int32,
            "int64" => SampleType::Int64,
            "uint8" => SampleType::UInt8,
            "uint16" => SampleType::UInt16,
            "uint32" => SampleType::UInt32,
            "uint64" => SampleType::UInt64,
            "complex32" => SampleType::ComplexFloat32,
            "complex64" => SampleType::ComplexFloat64,
            "struct" => SampleType::Struct,
            _ => return None,
        })
    }

    /// Size of one scalar sample in bytes (0 for variable-size types).
    pub fn size(self) -> usize {
        match self {
            SampleType::Int8 | SampleType::UInt8 => 1,
            SampleType::Int16 | SampleType::UInt16 => 2,
            SampleType::Float32 | SampleType::Int32 | SampleType::UInt32 => 4,
            SampleType::Float64 | SampleType::Int64 | SampleType::UInt64 => 8,
            SampleType::ComplexFloat32 => 8,
            SampleType::ComplexFloat64 => 16,
            SampleType::Struct | SampleType::Binary | SampleType::String => 0,
            SampleType::Undefined => 0,
        }
    }
}

/// How sample values are produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataRule {
    /// Every sample is carried explicitly.
    Explicit,
    /// `value[i] = packet_offset + start + i * delta`.
    Linear { delta: i64, start: i64 },
    /// Value stays constant until it changes.
    Constant,
    /// A rule this runtime cannot stream.
    Other(String),
}

impl DataRule {
    /// Name used in the `signal` metadata.
    pub fn wire_name(&self) -> &str {
        match self {
            DataRule::Explicit => "explicit",
            DataRule::Linear { .. } => "linear",
            DataRule::Constant => "constant",
            DataRule::Other(name) => name,
        }
    }

    pub fn is_linear(&self) -> bool {
        matches!(self, DataRule::Linear { .. })
    }
}

impl fmt::Display for DataRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.wire_name())
    }
}

/// Engineering unit.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Unit {
    pub id: i32,
    pub symbol: String,
    pub name: String,
    pub quantity: String,
}

impl Unit {
    pub fn new(symbol: impl Into<String>) -> Self {
        Self {
            id: -1,
            symbol: symbol.into(),
            ..Default::default()
        }
    }

    /// Seconds, the usual unit of a time domain.
    pub fn seconds() -> Self {
        Self {
            id: 5457219, // UNECE code for "s"
            symbol: "s".into(),
            name: "seconds".into(),
            quantity: "time".into(),
        }
    }
}

/// Expected value range.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Range {
    pub low: f64,
    pub high: f64,
}

/// Rational number, used for tick resolutions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ratio {
    pub num: i64,
    pub den: i64,
}

impl Ratio {
    pub fn new(num: i64, den: i64) -> Self {
        Self { num, den }
    }
}

/// One dimension of a multi-dimensional sample.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dimension {
    pub name: String,
    pub size: usize,
}

/// Describes the samples a signal produces.
#[derive(Debug, Clone, PartialEq)]
pub struct DataDescriptor {
    pub name: String,
    pub sample_type: SampleType,
    pub rule: DataRule,
    pub dimensions: Vec<Dimension>,
    pub unit: Option<Unit>,
    pub value_range: Option<Range>,
    pub origin: Option<String>,
    pub tick_resolution: Option<Ratio>,
    pub struct_fields: Vec<DataDescriptor>,
}

impl DataDescriptor {
    /// Explicit-rule descriptor of the given type.
    pub fn new(sample_type: SampleType) -> Self {
        Self {
            name: String::new(),
            sample_type,
            rule: DataRule::Explicit,
            dimensions: Vec::new(),
            unit: None,
            value_range: None,
            origin: None,
            tick_resolution: None,
            struct_fields: Vec::new(),
        }
    }

    /// Linear Int64 time domain ticking at `1 / tick_den` seconds.
    pub fn linear_time(delta: i64, tick_den: i64, origin: impl Into<String>) -> Self {
        Self::new(SampleType::Int64)
            .with_name("Time")
            .with_rule(DataRule::Linear { delta, start: 0 })
            .with_unit(Unit::seconds())
            .with_tick_resolution(Ratio::new(1, tick_den))
            .with_origin(origin)
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_rule(mut self, rule: DataRule) -> Self {
        self.rule = rule;
        self
    }

    pub fn with_unit(mut self, unit: Unit) -> Self {
        self.unit = Some(unit);
        self
    }

    pub fn with_range(mut self, low: f64, high: f64) -> Self {
        self.value_range = Some(Range { low, high });
        self
    }

    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = Some(origin.into());
        self
    }

    pub fn with_tick_resolution(mut self, resolution: Ratio) -> Self {
        self.tick_resolution = Some(resolution);
        self
    }

    pub fn with_dimension(mut self, name: impl Into<String>, size: usize) -> Self {
        self.dimensions.push(Dimension {
            name: name.into(),
            size,
        });
        self
    }

    pub fn with_struct_fields(mut self, fields: Vec<DataDescriptor>) -> Self {
        self.sample_type = SampleType::Struct;
        self.struct_fields = fields;
        self
    }

    /// Bytes per sample including dimensions and struct fields.
    pub fn sample_size(&self) -> usize {
        let scalar = if self.sample_type == SampleType::Struct {
            self.struct_fields.iter().map(|f| f.sample_size()).sum()
        } else {
            self.sample_type.size()
        };
        self.dimensions
            .iter()
            .fold(scalar, |acc, dim| acc * dim.size.max(1))
    }

    /// `delta` of a linear rule.
    pub fn linear_delta(&self) -> Option<i64> {
        match self.rule {
            DataRule::Linear { delta, .. } => Some(delta),
            _ => None,
        }
    }
}
