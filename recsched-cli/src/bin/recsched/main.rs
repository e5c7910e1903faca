/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

// Treat all Clippy warnings as errors.
#![deny(clippy::all)]

mod global_opts;
mod run;
mod tracing;

use anyhow::Error;
use clap::AppSettings;
use clap::Parser;
use colored::*;

use self::global_opts::GlobalOpts;
use self::run::ExitStatus;
use self::run::RunOpts;

#[derive(Debug, Parser)]
#[clap(name = "recsched", version)]
struct Args {
    #[clap(flatten)]
    global: GlobalOpts,

    #[clap(subcommand)]
    command: Subcommand,
}

#[derive(Debug, Parser)]
enum Subcommand {
    /// Run a program under ptrace, interleaving its threads with the record scheduler.
    #[clap(name = "run", setting = AppSettings::TrailingVarArg)]
    Run(Box<RunOpts>),
}

impl Subcommand {
    fn main(&self, global: &GlobalOpts) -> Result<ExitStatus, Error> {
        match self {
            Subcommand::Run(x) => x.main(global),
        }
    }
}

fn main() {
    let Args { global, command } = Args::parse();

    command
        .main(&global)
        .unwrap_or_else(|err| {
            display_error(err);
            ExitStatus::Exited(1)
        })
        .raise_or_exit();
}

fn display_error(error: Error) {
    let mut chain = error.chain();

    if let Some(error) = chain.next() {
        eprintln!("{}: {}", "Error".red().bold(), error);
    }

    for cause in chain {
        eprintln!("     {} {}", ">".dimmed().bold(), cause);
    }
}
