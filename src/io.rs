//! Trace-file parsing for the simulation driver.
//!
//! A trace is a line-oriented list of operations against the machine:
//!
//! ```text
//! # comment
//! file    <name> <len>
//! spawn   <ctx>
//! segment <ctx> <file> <addr> <offset> <read_bytes> <zero_bytes> <writable>
//! setsp   <ctx> <addr>
//! read    <ctx> <addr>
//! write   <ctx> <addr> <byte>
//! mmap    <ctx> <file> <addr>
//! munmap  <ctx> <id>
//! exit    <ctx>
//! ```
//!
//! Addresses accept hex (`0x...`) or decimal.

use std::fs;
use std::path::Path;
use thiserror::Error;

use crate::constants::VirtAddr;
use crate::mmap::MapId;
use crate::process::ContextId;

#[derive(Debug, Error)]
pub enum TraceError {
    #[error("failed to read trace file: {0}")]
    Read(String),
    #[error("line {line}: {reason}")]
    Parse { line: usize, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TraceOp {
    File {
        name: String,
        len: usize,
    },
    Spawn {
        ctx: ContextId,
    },
    Segment {
        ctx: ContextId,
        file: String,
        addr: VirtAddr,
        offset: usize,
        read_bytes: usize,
        zero_bytes: usize,
        writable: bool,
    },
    SetSp {
        ctx: ContextId,
        addr: VirtAddr,
    },
    Read {
        ctx: ContextId,
        addr: VirtAddr,
    },
    Write {
        ctx: ContextId,
        addr: VirtAddr,
        value: u8,
    },
    Mmap {
        ctx: ContextId,
        file: String,
        addr: VirtAddr,
    },
    Munmap {
        ctx: ContextId,
        id: MapId,
    },
    Exit {
        ctx: ContextId,
    },
}

pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Vec<TraceOp>, TraceError> {
    let content =
        fs::read_to_string(path.as_ref()).map_err(|e| TraceError::Read(e.to_string()))?;
    parse(&content)
}

pub fn parse(content: &str) -> Result<Vec<TraceOp>, TraceError> {
    let mut ops = Vec::new();
    for (index, raw) in content.lines().enumerate() {
        let line = index + 1;
        let text = match raw.find('#') {
            Some(pos) => &raw[..pos],
            None => raw,
        };
        let tokens: Vec<&str> = text.split_whitespace().collect();
        if tokens.is_empty() {
            continue;
        }
        ops.push(parse_op(line, &tokens)?);
    }
    Ok(ops)
}

fn parse_op(line: usize, tokens: &[&str]) -> Result<TraceOp, TraceError> {
    let expect = |want: usize| -> Result<(), TraceError> {
        if tokens.len() != want + 1 {
            return Err(TraceError::Parse {
                line,
                reason: format!(
                    "{} takes {} operands, got {}",
                    tokens[0],
                    want,
                    tokens.len() - 1
                ),
            });
        }
        Ok(())
    };

    match tokens[0] {
        "file" => {
            expect(2)?;
            Ok(TraceOp::File {
                name: tokens[1].to_string(),
                len: parse_num(line, tokens[2])?,
            })
        }
        "spawn" => {
            expect(1)?;
            Ok(TraceOp::Spawn {
                ctx: parse_num(line, tokens[1])? as ContextId,
            })
        }
        "segment" => {
            expect(7)?;
            Ok(TraceOp::Segment {
                ctx: parse_num(line, tokens[1])? as ContextId,
                file: tokens[2].to_string(),
                addr: parse_num(line, tokens[3])?,
                offset: parse_num(line, tokens[4])?,
                read_bytes: parse_num(line, tokens[5])?,
                zero_bytes: parse_num(line, tokens[6])?,
                writable: parse_bool(line, tokens[7])?,
            })
        }
        "setsp" => {
            expect(2)?;
            Ok(TraceOp::SetSp {
                ctx: parse_num(line, tokens[1])? as ContextId,
                addr: parse_num(line, tokens[2])?,
            })
        }
        "read" => {
            expect(2)?;
            Ok(TraceOp::Read {
                ctx: parse_num(line, tokens[1])? as ContextId,
                addr: parse_num(line, tokens[2])?,
            })
        }
        "write" => {
            expect(3)?;
            let value = parse_num(line, tokens[3])?;
            if value > u8::MAX as usize {
                return Err(TraceError::Parse {
                    line,
                    reason: format!("byte value {} out of range", value),
                });
            }
            Ok(TraceOp::Write {
                ctx: parse_num(line, tokens[1])? as ContextId,
                addr: parse_num(line, tokens[2])?,
                value: value as u8,
            })
        }
        "mmap" => {
            expect(3)?;
            Ok(TraceOp::Mmap {
                ctx: parse_num(line, tokens[1])? as ContextId,
                file: tokens[2].to_string(),
                addr: parse_num(line, tokens[3])?,
            })
        }
        "munmap" => {
            expect(2)?;
            Ok(TraceOp::Munmap {
                ctx: parse_num(line, tokens[1])? as ContextId,
                id: parse_num(line, tokens[2])? as MapId,
            })
        }
        "exit" => {
            expect(1)?;
            Ok(TraceOp::Exit {
                ctx: parse_num(line, tokens[1])? as ContextId,
            })
        }
        other => Err(TraceError::Parse {
            line,
            reason: format!("unknown operation: {}", other),
        }),
    }
}

fn parse_num(line: usize, token: &str) -> Result<usize, TraceError> {
    let parsed = match token.strip_prefix("0x").or_else(|| token.strip_prefix("0X")) {
        Some(hex) => usize::from_str_radix(hex, 16),
        None => token.parse(),
    };
    parsed.map_err(|_| TraceError::Parse {
        line,
        reason: format!("invalid number: {}", token),
    })
}

fn parse_bool(line: usize, token: &str) -> Result<bool, TraceError> {
    match token {
        "0" => Ok(false),
        "1" => Ok(true),
        _ => Err(TraceError::Parse {
            line,
            reason: format!("expected 0 or 1, got {}", token),
        }),
    }
}
