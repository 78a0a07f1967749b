use std::sync::Arc;

use nom::{
    IResult, Parser,
    bytes::complete::{tag, take},
    combinator::eof,
    error_position,
    multi::count,
    number::complete::{be_f32, be_f64, be_i32, be_i64, be_u16, be_u32, u8},
};

use crate::{
    class::{AttributeInfo, ClassFile, ConstantPoolInfo, FieldInfo, MethodInfo, mutf8},
    consts::{
        CLASS_MAGIC, ClassAccessFlag, FieldAccessFlag, MAX_MAJOR_VERSION, MIN_MAJOR_VERSION,
        MethodAccessFlag,
    },
    error::LoadingError,
};

/// Parses a complete class file. `name` is only used to label errors.
pub fn class_file(name: &str, bytes: &[u8]) -> Result<ClassFile, LoadingError> {
    let malformed = |err: nom::Err<nom::error::Error<&[u8]>>| {
        let reason = match err {
            nom::Err::Incomplete(_) => "truncated class file".to_string(),
            nom::Err::Error(e) | nom::Err::Failure(e) => format!(
                "{:?} at offset {}",
                e.code,
                bytes.len() - e.input.len()
            ),
        };
        LoadingError::malformed(name, reason)
    };

    let (input, (minor, major)) = parse_header(bytes).map_err(malformed)?;
    if !(MIN_MAJOR_VERSION..=MAX_MAJOR_VERSION).contains(&major) {
        return Err(LoadingError::UnsupportedVersion {
            class: name.to_string(),
            major,
            minor,
        });
    }

    let (input, constant_pool) = parse_constant_pool(input).map_err(malformed)?;
    let (input, access_flags) = be_u16(input).map_err(malformed)?;
    let (input, this_class) = be_u16(input).map_err(malformed)?;
    let (input, super_class) = be_u16(input).map_err(malformed)?;
    let (input, interfaces) = parse_interfaces(input).map_err(malformed)?;
    let (input, fields) = parse_fields(input).map_err(malformed)?;
    let (input, methods) = parse_methods(input).map_err(malformed)?;
    let (input, attributes) = parse_attributes(input).map_err(malformed)?;

    eof(input).map_err(malformed)?;

    let class = ClassFile {
        major_version: major,
        minor_version: minor,
        access_flags: ClassAccessFlag::from_bits_retain(access_flags),
        this_class,
        super_class,
        constant_pool,
        interfaces,
        fields,
        methods,
        attributes,
    };
    check_pool_references(&class)?;
    Ok(class)
}

fn parse_header(input: &[u8]) -> IResult<&[u8], (u16, u16)> {
    let (input, _) = tag(&CLASS_MAGIC.to_be_bytes() as &[u8]).parse(input)?;
    let (input, minor) = be_u16(input)?;
    let (input, major) = be_u16(input)?;
    Ok((input, (minor, major)))
}

fn parse_constant_pool(input: &[u8]) -> IResult<&[u8], Vec<ConstantPoolInfo>> {
    let (mut input, constant_pool_count) = be_u16(input)?;
    let entries = (constant_pool_count as usize).saturating_sub(1);

    let mut constant_pool = Vec::with_capacity(entries);

    while constant_pool.len() < entries {
        let constant;
        (input, constant) = parse_constant(input)?;
        let need_empty = matches!(
            constant,
            ConstantPoolInfo::Long(_) | ConstantPoolInfo::Double(_)
        );
        constant_pool.push(constant);
        if need_empty {
            constant_pool.push(ConstantPoolInfo::Empty);
        }
    }
    // a trailing long/double may not straddle the declared count
    if constant_pool.len() != entries {
        return Err(nom::Err::Error(error_position!(
            input,
            nom::error::ErrorKind::Count
        )));
    }

    Ok((input, constant_pool))
}

fn parse_constant(mut input: &[u8]) -> IResult<&[u8], ConstantPoolInfo> {
    let tag;
    (input, tag) = u8(input)?;
    let cp_info = match tag {
        1 => {
            let length;
            (input, length) = be_u16(input)?;
            let bytes;
            (input, bytes) = take(length).parse(input)?;
            let Some(string) = mutf8::decode_modified_utf8(bytes) else {
                return Err(nom::Err::Error(error_position!(
                    input,
                    nom::error::ErrorKind::Verify
                )));
            };
            ConstantPoolInfo::Utf8(Arc::from(string))
        }
        3 => {
            let int;
            (input, int) = be_i32(input)?;
            ConstantPoolInfo::Integer(int)
        }
        4 => {
            let float;
            (input, float) = be_f32(input)?;
            ConstantPoolInfo::Float(float)
        }
        5 => {
            let long;
            (input, long) = be_i64(input)?;
            ConstantPoolInfo::Long(long)
        }
        6 => {
            let double;
            (input, double) = be_f64(input)?;
            ConstantPoolInfo::Double(double)
        }
        7 => {
            let name_index;
            (input, name_index) = be_u16(input)?;
            ConstantPoolInfo::Class { name_index }
        }
        8 => {
            let string_index;
            (input, string_index) = be_u16(input)?;
            ConstantPoolInfo::String { string_index }
        }
        9..=11 => {
            let (class_index, name_and_type_index);
            (input, class_index) = be_u16(input)?;
            (input, name_and_type_index) = be_u16(input)?;
            match tag {
                9 => ConstantPoolInfo::Fieldref {
                    class_index,
                    name_and_type_index,
                },
                10 => ConstantPoolInfo::Methodref {
                    class_index,
                    name_and_type_index,
                },
                _ => ConstantPoolInfo::InterfaceMethodref {
                    class_index,
                    name_and_type_index,
                },
            }
        }
        12 => {
            let (name_index, descriptor_index);
            (input, name_index) = be_u16(input)?;
            (input, descriptor_index) = be_u16(input)?;
            ConstantPoolInfo::NameAndType {
                name_index,
                descriptor_index,
            }
        }
        15 => {
            let (reference_kind, reference_index);
            (input, reference_kind) = u8(input)?;
            (input, reference_index) = be_u16(input)?;
            ConstantPoolInfo::MethodHandle {
                reference_kind,
                reference_index,
            }
        }
        16 => {
            let descriptor_index;
            (input, descriptor_index) = be_u16(input)?;
            ConstantPoolInfo::MethodType { descriptor_index }
        }
        17 | 18 => {
            let (bootstrap_method_attr_index, name_and_type_index);
            (input, bootstrap_method_attr_index) = be_u16(input)?;
            (input, name_and_type_index) = be_u16(input)?;
            if tag == 17 {
                ConstantPoolInfo::Dynamic {
                    bootstrap_method_attr_index,
                    name_and_type_index,
                }
            } else {
                ConstantPoolInfo::InvokeDynamic {
                    bootstrap_method_attr_index,
                    name_and_type_index,
                }
            }
        }
        19 => {
            let name_index;
            (input, name_index) = be_u16(input)?;
            ConstantPoolInfo::Module { name_index }
        }
        20 => {
            let name_index;
            (input, name_index) = be_u16(input)?;
            ConstantPoolInfo::Package { name_index }
        }
        _ => {
            return Err(nom::Err::Error(error_position!(
                input,
                nom::error::ErrorKind::Tag
            )));
        }
    };
    Ok((input, cp_info))
}

fn parse_interfaces(input: &[u8]) -> IResult<&[u8], Vec<u16>> {
    let (input, interface_count) = be_u16(input)?;
    count(be_u16, interface_count as _).parse(input)
}

fn parse_fields(input: &[u8]) -> IResult<&[u8], Vec<FieldInfo>> {
    let (input, field_count) = be_u16(input)?;
    count(parse_field, field_count as _).parse(input)
}

fn parse_field(input: &[u8]) -> IResult<&[u8], FieldInfo> {
    let (input, access_flags) = be_u16(input)?;
    let (input, name_index) = be_u16(input)?;
    let (input, descriptor_index) = be_u16(input)?;
    let (input, attributes) = parse_attributes(input)?;
    Ok((
        input,
        FieldInfo {
            access_flags: FieldAccessFlag::from_bits_retain(access_flags),
            name_index,
            descriptor_index,
            attributes,
        },
    ))
}

fn parse_methods(input: &[u8]) -> IResult<&[u8], Vec<MethodInfo>> {
    let (input, methods_count) = be_u16(input)?;
    count(parse_method, methods_count as _).parse(input)
}

fn parse_method(input: &[u8]) -> IResult<&[u8], MethodInfo> {
    let (input, access_flags) = be_u16(input)?;
    let (input, name_index) = be_u16(input)?;
    let (input, descriptor_index) = be_u16(input)?;
    let (input, attributes) = parse_attributes(input)?;
    Ok((
        input,
        MethodInfo {
            access_flags: MethodAccessFlag::from_bits_retain(access_flags),
            name_index,
            descriptor_index,
            attributes,
        },
    ))
}

fn parse_attributes(input: &[u8]) -> IResult<&[u8], Vec<AttributeInfo>> {
    let (input, attributes_count) = be_u16(input)?;
    count(parse_attribute, attributes_count as _).parse(input)
}

fn parse_attribute(input: &[u8]) -> IResult<&[u8], AttributeInfo> {
    let (input, attribute_name_index) = be_u16(input)?;
    let (input, attribute_length) = be_u32(input)?;
    let (input, info) = take(attribute_length).parse(input)?;
    Ok((
        input,
        AttributeInfo {
            attribute_name_index,
            info: info.to_vec(),
        },
    ))
}

/// Every index stored in the pool must point at an entry of the right kind.
fn check_pool_references(class: &ClassFile) -> Result<(), LoadingError> {
    for entry in &class.constant_pool {
        match *entry {
            ConstantPoolInfo::Class { name_index }
            | ConstantPoolInfo::Module { name_index }
            | ConstantPoolInfo::Package { name_index } => {
                class.utf8(name_index)?;
            }
            ConstantPoolInfo::String { string_index } => {
                class.utf8(string_index)?;
            }
            ConstantPoolInfo::MethodType { descriptor_index } => {
                class.utf8(descriptor_index)?;
            }
            ConstantPoolInfo::Fieldref {
                class_index,
                name_and_type_index,
            }
            | ConstantPoolInfo::Methodref {
                class_index,
                name_and_type_index,
            }
            | ConstantPoolInfo::InterfaceMethodref {
                class_index,
                name_and_type_index,
            } => {
                class.class_name(class_index)?;
                class.name_and_type(name_and_type_index)?;
            }
            ConstantPoolInfo::NameAndType {
                name_index,
                descriptor_index,
            } => {
                class.utf8(name_index)?;
                class.utf8(descriptor_index)?;
            }
            ConstantPoolInfo::Dynamic {
                name_and_type_index,
                ..
            }
            | ConstantPoolInfo::InvokeDynamic {
                name_and_type_index,
                ..
            } => {
                class.name_and_type(name_and_type_index)?;
            }
            ConstantPoolInfo::MethodHandle {
                reference_index, ..
            } => {
                class.entry(reference_index)?;
            }
            _ => {}
        }
    }
    class.this_class_name()?;
    class.super_class_name()?;
    for &interface in &class.interfaces {
        class.class_name(interface)?;
    }
    for field in &class.fields {
        class.utf8(field.name_index)?;
        class.utf8(field.descriptor_index)?;
    }
    for method in &class.methods {
        class.utf8(method.name_index)?;
        class.utf8(method.descriptor_index)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::class::ClassBuilder;

    #[test]
    fn test_parse_built_class() {
        let mut builder = ClassBuilder::new("demo/Point");
        builder.field(FieldAccessFlag::PRIVATE, "x", "I");
        builder.method(MethodAccessFlag::PUBLIC, "getX", "()I", |code| {
            code.aload(0).getfield("demo/Point", "x", "I").ireturn();
        });
        let bytes = builder.build();

        let class = class_file("demo/Point", &bytes).unwrap();
        assert_eq!(&**class.this_class_name().unwrap(), "demo/Point");
        assert_eq!(
            class.super_class_name().unwrap().map(|s| &**s),
            Some("java/lang/Object")
        );
        assert_eq!(class.fields.len(), 1);
        assert_eq!(class.methods.len(), 1);
        let method = &class.methods[0];
        assert_eq!(&**class.utf8(method.name_index).unwrap(), "getX");
        assert!(
            class
                .find_attribute(&method.attributes, "Code")
                .unwrap()
                .is_some()
        );
    }

    #[test]
    fn test_bad_magic() {
        let err = class_file("X", &[0xCA, 0xFE, 0xBA, 0xBF, 0, 0, 0, 52]).unwrap_err();
        assert!(matches!(err, LoadingError::Malformed { .. }));
    }

    #[test]
    fn test_unsupported_version() {
        let err = class_file("X", &[0xCA, 0xFE, 0xBA, 0xBE, 0, 0, 0, 80]).unwrap_err();
        assert!(matches!(
            err,
            LoadingError::UnsupportedVersion { major: 80, .. }
        ));
    }

    #[test]
    fn test_truncated_and_trailing() {
        let bytes = ClassBuilder::new("T").build();
        assert!(class_file("T", &bytes[..bytes.len() - 1]).is_err());

        let mut trailing = bytes.clone();
        trailing.push(0);
        assert!(class_file("T", &trailing).is_err());

        assert!(class_file("T", &bytes).is_ok());
    }

    #[test]
    fn test_bad_pool_index() {
        let mut bytes = ClassBuilder::new("T").build();
        // a member-less class ends with access, this, super and four empty
        // counts; point this_class past the pool
        let this_offset = bytes.len() - 12;
        bytes[this_offset] = 0xFF;
        bytes[this_offset + 1] = 0xFF;
        assert!(matches!(
            class_file("T", &bytes),
            Err(LoadingError::Malformed { .. })
        ));
    }
}
