use std::{env, process::ExitCode};

use ovlsnoop::mountinject::{MountInjection, USAGE};

fn main() -> ExitCode {
    let injection = match MountInjection::from_args(env::args().skip(1)) {
        Ok(injection) => injection,
        Err(e) => {
            eprintln!("error: {e}");
            eprintln!("{USAGE}");
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = injection.run() {
        eprintln!("error: {e}");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}
