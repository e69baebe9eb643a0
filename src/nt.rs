//! Builders for the normative structure layouts used by EPICS tooling.
//!
//! These produce ordinary [`TypeDef`]s; nothing downstream treats them
//! specially. `NTScalar` is the shape served by the ubiquitous "mailbox"
//! style PVs and is the workhorse of the test suite.

use crate::typedesc::{Member, TypeCode, TypeDef};

/// The standard `time_t` sub-structure.
pub struct TimeStamp;

impl TimeStamp {
    pub fn build(self) -> TypeDef {
        TypeDef::from_member(Self::member("timeStamp"))
    }

    pub(crate) fn member(name: &str) -> Member {
        Member::with_id(
            TypeCode::Struct,
            name,
            "time_t",
            vec![
                Member::new(TypeCode::Int64, "secondsPastEpoch"),
                Member::new(TypeCode::Int32, "nanoseconds"),
                Member::new(TypeCode::Int32, "userTag"),
            ],
        )
    }
}

/// A scalar (or array of scalars) with alarm and timestamp meta-data.
///
/// ```
/// use pvars::{nt::NTScalar, TypeCode};
///
/// let mut val = NTScalar::new(TypeCode::Int32).create().unwrap();
/// val.update("value", 42).unwrap();
/// ```
pub struct NTScalar {
    /// Type of the `.value` field.
    pub value: TypeCode,
    /// Include display (range) meta-data.
    pub display: bool,
    /// Include control (range) meta-data.
    pub control: bool,
}

impl NTScalar {
    pub fn new(value: TypeCode) -> NTScalar {
        NTScalar {
            value,
            display: false,
            control: false,
        }
    }

    pub fn build(&self) -> TypeDef {
        let id = if self.value.is_array() {
            "epics:nt/NTScalarArray:1.0"
        } else {
            "epics:nt/NTScalar:1.0"
        };
        let mut members = vec![
            Member::new(self.value, "value"),
            Member::with_id(
                TypeCode::Struct,
                "alarm",
                "alarm_t",
                vec![
                    Member::new(TypeCode::Int32, "severity"),
                    Member::new(TypeCode::Int32, "status"),
                    Member::new(TypeCode::String, "message"),
                ],
            ),
            TimeStamp::member("timeStamp"),
        ];
        if self.display {
            members.push(Member::compound(
                TypeCode::Struct,
                "display",
                vec![
                    Member::new(TypeCode::Float64, "limitLow"),
                    Member::new(TypeCode::Float64, "limitHigh"),
                    Member::new(TypeCode::String, "description"),
                    Member::new(TypeCode::String, "units"),
                ],
            ));
        }
        if self.control {
            members.push(Member::compound(
                TypeCode::Struct,
                "control",
                vec![
                    Member::new(TypeCode::Float64, "limitLow"),
                    Member::new(TypeCode::Float64, "limitHigh"),
                    Member::new(TypeCode::Float64, "minStep"),
                ],
            ));
        }
        TypeDef::structure(id, members)
    }

    pub fn create(&self) -> Result<crate::value::MValue, crate::error::Error> {
        self.build().create()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ntscalar_layout() {
        let desc = NTScalar::new(TypeCode::UInt32).build().build().unwrap();
        // storage index layout relied on by the wire tests
        assert_eq!(desc.len(), 10);
        assert_eq!(desc.root().mlookup["value"], 1);
        assert_eq!(desc.root().mlookup["alarm.message"], 5);
        assert_eq!(desc.root().mlookup["timeStamp.nanoseconds"], 8);
        assert_eq!(desc.root().mlookup["timeStamp.userTag"], 9);
        assert_eq!(desc.root().id, "epics:nt/NTScalar:1.0");
    }

    #[test]
    fn display_and_control_extend() {
        let mut nt = NTScalar::new(TypeCode::Float64);
        nt.display = true;
        nt.control = true;
        let desc = nt.build().build().unwrap();
        assert!(desc.root().mlookup.contains_key("display.units"));
        assert!(desc.root().mlookup.contains_key("control.minStep"));
    }
}
