//! Excel COM Bridge: a Windows process that owns one Excel instance and its
//! object graph, controlled by JSON commands over stdin/stdout.
//!
//! Designed to be cross-compiled from Linux and run under WINE.
//!
//! Protocol: one JSON object per line (newline-delimited JSON).
//! - Reads `Request` objects from stdin
//! - Writes `Response` objects to stdout
//! - Diagnostic/log messages go to stderr (never stdout)

#[cfg(windows)]
mod dispatch;
#[cfg(windows)]
mod excel;
#[cfg(any(windows, test))]
mod table;

#[cfg(not(windows))]
fn main() {
    eprintln!("excel-com-bridge must be compiled for Windows (--target x86_64-pc-windows-gnu)");
    eprintln!("and run under WINE on Linux.");
    std::process::exit(1);
}

#[cfg(windows)]
fn main() {
    use std::io::{self, BufRead};

    use excel_com_protocol::bridge::{Command, Request, Response, ResponseResult};

    eprintln!("[excel-com-bridge] Starting up...");

    let stdin = io::stdin();
    let stdout = io::stdout();
    let mut out = stdout.lock();

    let mut excel: Option<excel::ExcelHost> = None;

    for line in stdin.lock().lines() {
        let line = match line {
            Ok(l) => l,
            Err(e) => {
                eprintln!("[excel-com-bridge] stdin read error: {e}");
                break;
            }
        };

        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let request: Request = match serde_json::from_str(line) {
            Ok(r) => r,
            Err(e) => {
                eprintln!("[excel-com-bridge] JSON parse error: {e}");
                eprintln!("[excel-com-bridge] Line was: {line}");
                // id 0 never matches a pending request; the client skips it
                if !send(&mut out, &Response::error(0, format!("JSON parse error: {e}"), None)) {
                    break;
                }
                continue;
            }
        };

        let response = handle_command(&mut excel, &request);
        let shut_down = matches!(request.command, Command::Shutdown)
            && matches!(response.result, ResponseResult::Ok { .. });
        if !send(&mut out, &response) || shut_down {
            break;
        }
    }

    if let Some(host) = excel {
        eprintln!("[excel-com-bridge] stdin closed, shutting down Excel...");
        if let Err(e) = host.shutdown() {
            eprintln!("[excel-com-bridge] shutdown failed: {}", e.message);
        }
        uninit_com();
    }

    eprintln!("[excel-com-bridge] Process exiting.");
}

/// Write one response line. Returns false when stdout is gone.
#[cfg(windows)]
fn send(out: &mut impl std::io::Write, response: &excel_com_protocol::bridge::Response) -> bool {
    let json = match serde_json::to_string(response) {
        Ok(json) => json,
        Err(e) => {
            eprintln!("[excel-com-bridge] failed to encode response: {e}");
            return true;
        }
    };
    if let Err(e) = writeln!(out, "{json}").and_then(|_| out.flush()) {
        eprintln!("[excel-com-bridge] stdout write error: {e}");
        return false;
    }
    true
}

#[cfg(windows)]
fn handle_command(
    excel: &mut Option<excel::ExcelHost>,
    request: &excel_com_protocol::bridge::Request,
) -> excel_com_protocol::bridge::Response {
    use excel_com_protocol::bridge::{Command, Response};

    let id = request.id;
    let result = match &request.command {
        Command::Init { path, visible } => init_com_and_excel(excel, path.as_deref(), *visible),
        Command::GetProperty { target, name, args } => {
            with_excel(excel, |host| host.get_property(*target, name, args).map(Some))
        }
        Command::SetProperty {
            target,
            name,
            value,
        } => with_excel(excel, |host| host.set_property(*target, name, value).map(|_| None)),
        Command::Invoke { target, name, args } => {
            with_excel(excel, |host| host.invoke(*target, name, args).map(Some))
        }
        Command::Release { handle } => with_excel(excel, |host| host.release(*handle).map(|_| None)),
        Command::Ping => with_excel(excel, |host| host.ping().map(|_| None)),
        Command::Save { path } => with_excel(excel, |host| host.save(path.as_deref()).map(|_| None)),
        Command::SetVisible { visible } => {
            with_excel(excel, |host| host.set_visible(*visible).map(|_| None))
        }
        Command::Shutdown => match excel.take() {
            Some(host) => match host.shutdown() {
                Ok(()) => {
                    uninit_com();
                    Ok(None)
                }
                Err(e) => Err(dispatch::ComError {
                    message: format!("Shutdown failed: {}", e.message),
                    hresult: e.hresult,
                }),
            },
            None => Ok(None),
        },
    };

    match result {
        Ok(data) => Response::ok(id, data),
        Err(e) => Response::error(id, e.message, e.hresult),
    }
}

#[cfg(windows)]
fn init_com_and_excel(
    excel: &mut Option<excel::ExcelHost>,
    path: Option<&str>,
    visible: bool,
) -> Result<Option<excel_com_protocol::Variant>, dispatch::ComError> {
    use windows::Win32::System::Com::{CoInitializeEx, COINIT_APARTMENTTHREADED};

    if excel.is_some() {
        return Err(dispatch::ComError::msg("Excel is already initialized"));
    }

    // Excel requires a single-threaded apartment
    unsafe {
        CoInitializeEx(None, COINIT_APARTMENTTHREADED)
            .ok()
            .map_err(|e| dispatch::ComError {
                message: format!("CoInitializeEx failed: {e}"),
                hresult: Some(e.code().0),
            })?;
    }
    eprintln!("[excel-com-bridge] COM initialized (STA)");

    match excel::ExcelHost::start(path, visible) {
        Ok((host, root)) => {
            eprintln!("[excel-com-bridge] Excel.Application started, workbook is {root}");
            *excel = Some(host);
            Ok(Some(excel_com_protocol::Variant::Object { handle: root }))
        }
        Err(e) => {
            uninit_com();
            Err(dispatch::ComError {
                message: format!("Failed to start Excel: {}", e.message),
                hresult: e.hresult,
            })
        }
    }
}

#[cfg(windows)]
fn uninit_com() {
    unsafe {
        windows::Win32::System::Com::CoUninitialize();
    }
    eprintln!("[excel-com-bridge] COM uninitialized");
}

#[cfg(windows)]
fn with_excel(
    excel: &mut Option<excel::ExcelHost>,
    f: impl FnOnce(
        &mut excel::ExcelHost,
    ) -> Result<Option<excel_com_protocol::Variant>, dispatch::ComError>,
) -> Result<Option<excel_com_protocol::Variant>, dispatch::ComError> {
    match excel.as_mut() {
        Some(host) => f(host),
        None => Err(dispatch::ComError::msg(
            "Excel not initialized. Send 'Init' command first.",
        )),
    }
}
