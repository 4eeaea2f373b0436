use std::process::ExitCode;

fn main() -> ExitCode {
    let code = clickspeak_launcher_lib::run_process();
    ExitCode::from(u8::try_from(code).unwrap_or(1))
}
