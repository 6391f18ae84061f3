#![forbid(unsafe_code)]

use ctn_core::SingleFeature;
use ctn_features::InlineData;
use std::process::ExitCode;

fn main() -> ExitCode {
    let mut op = SingleFeature::new(InlineData);
    ctn_cli::operation_main(&mut op, std::env::args_os())
}
