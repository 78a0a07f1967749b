use std::{fmt, str::FromStr, sync::Arc};

use nom::{
    IResult, Parser,
    branch::alt,
    bytes::complete::take_until,
    character::complete::{char, one_of},
    combinator::{eof, map},
    multi::many0,
    sequence::delimited,
};

use crate::error::LoadingError;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FieldDescriptor(pub FieldType);

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MethodDescriptor {
    pub parameters: Vec<FieldType>,
    pub return_type: ReturnType,
}

pub type ReturnType = Option<FieldType>;

#[derive(Debug, PartialEq, Eq, Clone, Hash)]
pub enum FieldType {
    Byte,
    Char,
    Double,
    Float,
    Int,
    Long,
    Object(Arc<str>),
    Short,
    Boolean,
    Array(Box<FieldType>),
}

impl FieldType {
    /// Category 2 values take two local/stack slots.
    pub fn is_long(&self) -> bool {
        matches!(self, FieldType::Long | FieldType::Double)
    }

    pub fn is_reference(&self) -> bool {
        matches!(self, FieldType::Object(_) | FieldType::Array(_))
    }

    pub fn slot_size(&self) -> usize {
        if self.is_long() { 2 } else { 1 }
    }

    /// Storage size of one array element of this type, in bytes.
    pub fn element_size(&self) -> usize {
        match self {
            FieldType::Byte | FieldType::Boolean => 1,
            FieldType::Char | FieldType::Short => 2,
            FieldType::Int | FieldType::Float => 4,
            FieldType::Long | FieldType::Double => 8,
            FieldType::Object(_) | FieldType::Array(_) => 4,
        }
    }

    /// Internal class name used when this type is the class of an object:
    /// `java/lang/String` for objects, the descriptor itself for arrays.
    pub fn class_name(&self) -> Option<Arc<str>> {
        match self {
            FieldType::Object(name) => Some(name.clone()),
            FieldType::Array(_) => Some(Arc::from(self.to_string())),
            _ => None,
        }
    }

    /// Inverse of [`FieldType::class_name`] for array class names.
    pub fn from_class_name(name: &str) -> Result<FieldType, LoadingError> {
        if name.starts_with('[') {
            name.parse::<FieldDescriptor>().map(|d| d.0)
        } else {
            Ok(FieldType::Object(Arc::from(name)))
        }
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldType::Byte => f.write_str("B"),
            FieldType::Char => f.write_str("C"),
            FieldType::Double => f.write_str("D"),
            FieldType::Float => f.write_str("F"),
            FieldType::Int => f.write_str("I"),
            FieldType::Long => f.write_str("J"),
            FieldType::Short => f.write_str("S"),
            FieldType::Boolean => f.write_str("Z"),
            FieldType::Object(name) => write!(f, "L{name};"),
            FieldType::Array(component) => write!(f, "[{component}"),
        }
    }
}

impl MethodDescriptor {
    /// Slots occupied by the declared parameters, excluding any receiver.
    pub fn parameter_slots(&self) -> usize {
        self.parameters.iter().map(FieldType::slot_size).sum()
    }
}

impl fmt::Display for MethodDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("(")?;
        for parameter in &self.parameters {
            write!(f, "{parameter}")?;
        }
        f.write_str(")")?;
        match &self.return_type {
            Some(ty) => write!(f, "{ty}"),
            None => f.write_str("V"),
        }
    }
}

impl FromStr for FieldDescriptor {
    type Err = LoadingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_field_descriptor(s)
            .map(|(_, descriptor)| descriptor)
            .map_err(|_| LoadingError::malformed(s, "invalid field descriptor"))
    }
}

impl FromStr for MethodDescriptor {
    type Err = LoadingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_method_descriptor(s)
            .map(|(_, descriptor)| descriptor)
            .map_err(|_| LoadingError::malformed(s, "invalid method descriptor"))
    }
}

pub fn parse_field_descriptor(input: &str) -> IResult<&str, FieldDescriptor> {
    let (input, field_type) = parse_field_type(input)?;
    eof(input)?;
    Ok((input, FieldDescriptor(field_type)))
}

pub fn parse_method_descriptor(input: &str) -> IResult<&str, MethodDescriptor> {
    let (input, parameters) =
        delimited(char('('), many0(parse_field_type), char(')')).parse(input)?;

    let (input, return_type) = parse_return_type_descriptor(input)?;

    eof(input)?;
    Ok((
        input,
        MethodDescriptor {
            parameters,
            return_type,
        },
    ))
}

pub fn parse_return_type_descriptor(input: &str) -> IResult<&str, ReturnType> {
    alt((map(parse_field_type, Some), parse_void_type)).parse(input)
}

fn parse_field_type(input: &str) -> IResult<&str, FieldType> {
    alt((parse_base_type, parse_object_type, parse_array_type)).parse(input)
}

fn parse_base_type(input: &str) -> IResult<&str, FieldType> {
    let (input, ch) = one_of("BCDFIJSZ").parse(input)?;
    let field_type = match ch {
        'B' => FieldType::Byte,
        'C' => FieldType::Char,
        'D' => FieldType::Double,
        'F' => FieldType::Float,
        'I' => FieldType::Int,
        'J' => FieldType::Long,
        'S' => FieldType::Short,
        _ => FieldType::Boolean,
    };
    Ok((input, field_type))
}

fn parse_object_type(input: &str) -> IResult<&str, FieldType> {
    let (input, _) = char('L').parse(input)?;
    let (input, class_name) = take_until(";").parse(input)?;
    let (input, _) = char(';').parse(input)?;

    if class_name.is_empty() {
        return Err(nom::Err::Error(nom::error::Error::new(
            input,
            nom::error::ErrorKind::Verify,
        )));
    }

    Ok((input, FieldType::Object(Arc::from(class_name))))
}

fn parse_array_type(input: &str) -> IResult<&str, FieldType> {
    let (input, _) = char('[').parse(input)?;
    let (input, field_type) = parse_field_type(input)?;
    Ok((input, FieldType::Array(Box::new(field_type))))
}

fn parse_void_type(input: &str) -> IResult<&str, Option<FieldType>> {
    let (input, _) = char('V').parse(input)?;
    Ok((input, None))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_method_descriptor() {
        let descriptor: MethodDescriptor = "(IJ[Ljava/lang/String;D)Ljava/lang/Object;"
            .parse()
            .unwrap();
        assert_eq!(descriptor.parameters.len(), 4);
        assert_eq!(descriptor.parameter_slots(), 6);
        assert_eq!(
            descriptor.return_type,
            Some(FieldType::Object("java/lang/Object".into()))
        );
        assert_eq!(
            descriptor.to_string(),
            "(IJ[Ljava/lang/String;D)Ljava/lang/Object;"
        );
    }

    #[test]
    fn test_void_and_empty() {
        let descriptor: MethodDescriptor = "()V".parse().unwrap();
        assert!(descriptor.parameters.is_empty());
        assert!(descriptor.return_type.is_none());
    }

    #[test]
    fn test_invalid() {
        assert!("(I".parse::<MethodDescriptor>().is_err());
        assert!("(L;)V".parse::<MethodDescriptor>().is_err());
        assert!("IV".parse::<FieldDescriptor>().is_err());
        assert!("V".parse::<FieldDescriptor>().is_err());
    }

    #[test]
    fn test_array_class_name() {
        let ty = FieldType::from_class_name("[[I").unwrap();
        assert_eq!(
            ty,
            FieldType::Array(Box::new(FieldType::Array(Box::new(FieldType::Int))))
        );
        assert_eq!(ty.class_name().as_deref(), Some("[[I"));
        assert_eq!(
            FieldType::from_class_name("java/lang/Object").unwrap(),
            FieldType::Object("java/lang/Object".into())
        );
    }
}
