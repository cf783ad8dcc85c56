//! Parser for the `-hc-function-info` side-channel file.
//!
//! UTF-8 text, one comma-separated record per line. Two record shapes,
//! selected by the type token:
//!
//! ```text
//! functions : <version>,<name>,<type>,<flags>,<local_x>,<local_y>,<local_z>,<simd-width>,<args...>
//! arg-buffer: <version>,<name>,<type>,<flags>,<arg # in function>,0,0,0,<args...>
//! ```
//!
//! An argument-buffer record must come after the function entry that uses it
//! and attaches to that function's argument at the given index. Each argument
//! is six tokens: size, array extent, address space, access, image type,
//! flags.

use hcapi::{
    ArgAccess, ArgAddressSpace, ArgFlags, ArgImageType, ArgInfo, FunctionFlags, FunctionInfo,
    FunctionType, UInt3,
};

use crate::{Result, ToolchainError};

/// Format version this parser understands; a mismatch is fatal.
const FUNCTION_INFO_VERSION: &str = "7";

const FUNCTION_TOKEN_COUNT: usize = 8;
const ARG_TOKEN_COUNT: usize = 6;

fn info_err(msg: impl Into<String>) -> ToolchainError {
    let msg = msg.into();
    log::error!("{msg}");
    ToolchainError::FunctionInfo(msg)
}

fn parse_u64(token: &str) -> Result<u64> {
    token.parse::<u64>().map_err(|_| info_err(format!("invalid numeric token: {token:?}")))
}

pub fn parse_function_info_file(path: &std::path::Path) -> Result<Vec<FunctionInfo>> {
    let contents = std::fs::read_to_string(path).map_err(|e| {
        log::error!("failed to retrieve function info from \"{}\": {e}", path.display());
        ToolchainError::Io(e)
    })?;
    parse_function_info(&contents)
}

pub fn parse_function_info(contents: &str) -> Result<Vec<FunctionInfo>> {
    let mut functions: Vec<FunctionInfo> = Vec::new();

    for line in contents.lines() {
        if line.is_empty() {
            continue;
        }
        let tokens: Vec<&str> = line.split(',').collect();
        if tokens.len() < FUNCTION_TOKEN_COUNT {
            return Err(info_err(format!("invalid function info entry: {line}")));
        }
        if tokens[0] != FUNCTION_INFO_VERSION {
            return Err(info_err(format!(
                "invalid function info version, expected {FUNCTION_INFO_VERSION}, got {}",
                tokens[0]
            )));
        }

        let name = tokens[1].to_string();
        let Some(func_type) = FunctionType::from_token(tokens[2]) else {
            return Err(info_err(format!("unsupported function type: {}", tokens[2])));
        };
        let flags = FunctionFlags::from_bits_retain(parse_u64(tokens[3])?);

        let mut required_local_size = UInt3::zero();
        let mut required_simd_width = 0u32;
        if func_type != FunctionType::ArgumentBufferStruct {
            required_local_size = UInt3::new(parse_u64(tokens[4])? as u32,
                                             parse_u64(tokens[5])? as u32,
                                             parse_u64(tokens[6])? as u32);
            required_simd_width = parse_u64(tokens[7])? as u32;
        } else {
            // Argument buffer structs have no execution constraints; the
            // fields must be written as zero.
            for token in &tokens[5..FUNCTION_TOKEN_COUNT] {
                if *token != "0" {
                    return Err(info_err(
                        "required local size and SIMD width must be 0 for argument buffer struct info",
                    ));
                }
            }
        }

        if (tokens.len() - FUNCTION_TOKEN_COUNT) % ARG_TOKEN_COUNT != 0 {
            return Err(info_err(format!("invalid args token count in entry: {line}")));
        }
        let mut args = Vec::new();
        for arg_tokens in tokens[FUNCTION_TOKEN_COUNT..].chunks_exact(ARG_TOKEN_COUNT) {
            args.push(ArgInfo {
                size: parse_u64(arg_tokens[0])?,
                array_extent: parse_u64(arg_tokens[1])?,
                address_space: ArgAddressSpace::from_raw(parse_u64(arg_tokens[2])?),
                access: ArgAccess::from_raw(parse_u64(arg_tokens[3])?),
                image_type: ArgImageType(parse_u64(arg_tokens[4])? as u32),
                flags: ArgFlags::from_bits_retain(parse_u64(arg_tokens[5])?),
                argument_buffer_info: None,
            });
        }

        let info = FunctionInfo {
            name,
            func_type,
            flags,
            required_local_size,
            required_simd_width,
            args,
        };

        if info.func_type == FunctionType::ArgumentBufferStruct {
            let arg_idx = parse_u64(tokens[4])? as usize;
            let Some(func) = functions.iter_mut().rev().find(|f| f.name == info.name) else {
                return Err(info_err(format!("didn't find function {} for argument buffer",
                                            info.name)));
            };
            if arg_idx >= func.args.len() {
                return Err(info_err(format!(
                    "argument index {arg_idx} is out-of-bounds for function {} with {} args",
                    info.name,
                    func.args.len()
                )));
            }
            let arg = &mut func.args[arg_idx];
            if !arg.flags.contains(ArgFlags::ARGUMENT_BUFFER) {
                return Err(info_err(format!(
                    "argument index {arg_idx} in function {} is not an argument buffer", info.name
                )));
            }
            arg.argument_buffer_info = Some(Box::new(info));
        } else {
            functions.push(info);
        }
    }

    // every argument flagged as an argument buffer must have received its
    // layout info by now
    for func in &functions {
        for (i, arg) in func.args.iter().enumerate() {
            if arg.flags.contains(ArgFlags::ARGUMENT_BUFFER) && arg.argument_buffer_info.is_none() {
                return Err(info_err(format!(
                    "missing argument buffer info for argument #{i} in function {}", func.name
                )));
            }
        }
    }

    Ok(functions)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_functions_with_args() {
        let input = "7,vec_add,1,0,0,0,0,0,8,0,1,3,0,0,8,0,1,3,0,0,4,0,0,0,0,0\n\
                     7,transpose,1,0,16,16,1,16\n";
        let functions = parse_function_info(input).unwrap();
        assert_eq!(functions.len(), 2);

        let vec_add = &functions[0];
        assert_eq!(vec_add.name, "vec_add");
        assert_eq!(vec_add.func_type, FunctionType::Kernel);
        assert_eq!(vec_add.args.len(), 3);
        assert_eq!(vec_add.args[0].size, 8);
        assert_eq!(vec_add.args[0].address_space, ArgAddressSpace::Global);
        assert_eq!(vec_add.args[0].access, ArgAccess::ReadWrite);
        assert_eq!(vec_add.args[2].size, 4);
        assert!(vec_add.required_local_size.is_zero());

        let transpose = &functions[1];
        assert_eq!(transpose.required_local_size, UInt3::new(16, 16, 1));
        assert_eq!(transpose.required_simd_width, 16);
        assert!(transpose.args.is_empty());
    }

    #[test]
    fn rejects_version_mismatch() {
        let err = parse_function_info("6,f,1,0,0,0,0,0\n").unwrap_err();
        assert!(matches!(err, ToolchainError::FunctionInfo(msg) if msg.contains("version")));
    }

    #[test]
    fn rejects_short_records() {
        assert!(parse_function_info("7,f,1,0\n").is_err());
    }

    #[test]
    fn attaches_argument_buffer_struct() {
        // function f with arg 0 flagged as an argument buffer (flag bit 0),
        // followed by the struct record describing two nested args
        let input = "7,f,1,0,0,0,0,0,64,0,1,3,0,1\n\
                     7,f,100,0,0,0,0,0,8,0,1,3,0,0,4,0,0,0,0,0\n";
        let functions = parse_function_info(input).unwrap();
        assert_eq!(functions.len(), 1);
        let nested = functions[0].args[0].argument_buffer_info.as_ref().unwrap();
        assert_eq!(nested.func_type, FunctionType::ArgumentBufferStruct);
        assert_eq!(nested.args.len(), 2);
    }

    #[test]
    fn rejects_struct_record_before_its_function() {
        let input = "7,f,100,0,0,0,0,0,8,0,1,3,0,0\n\
                     7,f,1,0,0,0,0,0,64,0,1,3,0,1\n";
        let err = parse_function_info(input).unwrap_err();
        assert!(matches!(err, ToolchainError::FunctionInfo(msg)
                         if msg.contains("didn't find function")));
    }

    #[test]
    fn rejects_struct_record_with_local_size_constraint() {
        let input = "7,f,1,0,0,0,0,0,64,0,1,3,0,1\n\
                     7,f,100,0,0,1,0,0,8,0,1,3,0,0\n";
        assert!(parse_function_info(input).is_err());
    }

    #[test]
    fn rejects_struct_record_for_non_argument_buffer_arg() {
        let input = "7,f,1,0,0,0,0,0,64,0,1,3,0,0\n\
                     7,f,100,0,0,0,0,0,8,0,1,3,0,0\n";
        let err = parse_function_info(input).unwrap_err();
        assert!(matches!(err, ToolchainError::FunctionInfo(msg)
                         if msg.contains("not an argument buffer")));
    }

    #[test]
    fn rejects_missing_argument_buffer_info() {
        let input = "7,f,1,0,0,0,0,0,64,0,1,3,0,1\n";
        let err = parse_function_info(input).unwrap_err();
        assert!(matches!(err, ToolchainError::FunctionInfo(msg)
                         if msg.contains("missing argument buffer info")));
    }
}
