use std::process::ExitCode;

fn main() -> ExitCode {
    nsscache::run()
}
