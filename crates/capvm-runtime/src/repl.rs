//! Interactive loops
//!
//! Two line disciplines over a byte [`Console`]:
//!
//! - **raw**: input is collected verbatim until Ctrl-D, then executed as a
//!   file. The reply is `OK`, the output, `\x04`, any exception report,
//!   `\x04`. Ctrl-D on an empty buffer asks for a soft reset and Ctrl-B
//!   switches to the friendly loop.
//! - **friendly**: `>>> ` prompts with echo, compound statements continue
//!   at `... ` until a blank line, expression results are printed. Ctrl-A
//!   switches to raw mode, Ctrl-C abandons the current input and Ctrl-D on
//!   an empty line asks for a soft reset.
//!
//! Running out of input is treated as a soft reset.

use std::collections::VecDeque;

use capvm_engine::{needs_more_input, ExcKind, Mode, OutputSink, SharedBuffer, Vm};

const CTRL_A: u8 = 0x01;
const CTRL_B: u8 = 0x02;
const CTRL_C: u8 = 0x03;
const CTRL_D: u8 = 0x04;
const BACKSPACE: u8 = 0x08;
const DELETE: u8 = 0x7f;

/// Status of a loop that ended by asking for a soft reset.
pub const FORCED_EXIT: i32 = 0x100;

/// Byte-level terminal.
pub trait Console {
    /// Next input byte, or `None` once input is exhausted.
    fn read_byte(&mut self) -> Option<u8>;

    fn write(&mut self, text: &str);
}

/// A console fed from a fixed byte string that records everything written.
#[derive(Debug, Default)]
pub struct ScriptedConsole {
    input: VecDeque<u8>,
    output: String,
}

impl ScriptedConsole {
    pub fn new(input: impl AsRef<[u8]>) -> Self {
        ScriptedConsole {
            input: input.as_ref().iter().copied().collect(),
            output: String::new(),
        }
    }

    pub fn output(&self) -> &str {
        &self.output
    }

    pub fn take_output(&mut self) -> String {
        std::mem::take(&mut self.output)
    }
}

impl Console for ScriptedConsole {
    fn read_byte(&mut self) -> Option<u8> {
        self.input.pop_front()
    }

    fn write(&mut self, text: &str) {
        self.output.push_str(text);
    }
}

/// Which loop auto mode runs next.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReplMode {
    Raw,
    #[default]
    Friendly,
}

/// How an interactive loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplExit {
    /// The user switched to the other loop.
    SwitchMode,
    /// Soft reset requested (Ctrl-D, `SystemExit` or end of input).
    SoftReset,
}

impl ReplExit {
    pub fn status(self) -> i32 {
        match self {
            ReplExit::SwitchMode => 0,
            ReplExit::SoftReset => FORCED_EXIT,
        }
    }
}

enum Outcome {
    Completed,
    Raised,
    SystemExit,
}

/// Runs `source`, sending its output and any exception report to `console`.
/// With `eof_markers`, each of the two is followed by `\x04`.
fn execute(vm: &mut Vm, console: &mut dyn Console, source: &str, mode: Mode, eof_markers: bool) -> Outcome {
    let capture = SharedBuffer::new();
    let saved = vm.output().clone();
    vm.set_output(OutputSink::Buffer(capture.clone()));
    let result = vm.protected(|vm| match mode {
        Mode::Single => vm.exec(source, Mode::Single),
        Mode::File => vm.exec_module("<stdin>", source),
    });
    console.write(&capture.take());
    if eof_markers {
        console.write("\x04");
    }
    let outcome = match result {
        Ok(()) => Outcome::Completed,
        Err(exc) if vm.exception_kind(exc).is_some_and(|k| k.is_a(ExcKind::SystemExit)) => Outcome::SystemExit,
        Err(exc) => {
            console.write(&vm.format_exception(exc));
            Outcome::Raised
        }
    };
    if eof_markers {
        console.write("\x04");
    }
    vm.set_output(saved);
    outcome
}

/// Runs a whole module on behalf of a loop (auto mode's `boot.py`).
pub(crate) fn execute_module(vm: &mut Vm, console: &mut dyn Console, source: &str) -> Option<ReplExit> {
    match execute(vm, console, source, Mode::File, false) {
        Outcome::SystemExit => Some(ReplExit::SoftReset),
        Outcome::Completed | Outcome::Raised => None,
    }
}

pub(crate) fn raw_repl(vm: &mut Vm, console: &mut dyn Console, mode: &mut ReplMode) -> ReplExit {
    *mode = ReplMode::Raw;
    'reset: loop {
        console.write("raw REPL; CTRL-B to exit\r\n");
        loop {
            let mut line = Vec::new();
            console.write(">");
            loop {
                match console.read_byte() {
                    None => return ReplExit::SoftReset,
                    Some(CTRL_A) => continue 'reset,
                    Some(CTRL_B) => {
                        console.write("\r\n");
                        *mode = ReplMode::Friendly;
                        return ReplExit::SwitchMode;
                    }
                    Some(CTRL_C) => line.clear(),
                    Some(CTRL_D) => break,
                    Some(byte) => line.push(byte),
                }
            }
            console.write("OK");
            if line.is_empty() {
                console.write("\r\n");
                return ReplExit::SoftReset;
            }
            let source = String::from_utf8_lossy(&line);
            if let Outcome::SystemExit = execute(vm, console, &source, Mode::File, true) {
                return ReplExit::SoftReset;
            }
        }
    }
}

enum Read {
    Line,
    Control(u8),
    Eof,
}

/// Line editor: echo, backspace, and control keys returned to the caller.
struct LineReader {
    after_cr: bool,
}

impl LineReader {
    /// Appends one line to `line`. Ctrl-D is only special on an empty line.
    fn read(&mut self, console: &mut dyn Console, prompt: &str, line: &mut String) -> Read {
        console.write(prompt);
        let start = line.len();
        loop {
            let Some(byte) = console.read_byte() else {
                return Read::Eof;
            };
            let after_cr = std::mem::replace(&mut self.after_cr, byte == b'\r');
            match byte {
                b'\n' if after_cr => {}
                b'\r' | b'\n' => {
                    console.write("\r\n");
                    return Read::Line;
                }
                CTRL_A | CTRL_B | CTRL_C => return Read::Control(byte),
                CTRL_D if line.len() == start => return Read::Control(byte),
                BACKSPACE | DELETE => {
                    if line.len() > start {
                        line.pop();
                        console.write("\x08 \x08");
                    }
                }
                b'\t' | 0x20..=0x7e => {
                    let c = char::from(byte);
                    line.push(c);
                    console.write(c.encode_utf8(&mut [0u8; 4]));
                }
                _ => {}
            }
        }
    }
}

pub(crate) fn friendly_repl(vm: &mut Vm, console: &mut dyn Console, mode: &mut ReplMode, name: &str) -> ReplExit {
    *mode = ReplMode::Friendly;
    let mut reader = LineReader { after_cr: false };
    'reset: loop {
        console.write(&format!(
            "capvm {} in compartment '{}'\r\n",
            env!("CARGO_PKG_VERSION"),
            name
        ));
        'input: loop {
            let mut line = String::new();
            match reader.read(console, ">>> ", &mut line) {
                Read::Eof => return ReplExit::SoftReset,
                Read::Control(CTRL_A) => {
                    console.write("\r\n");
                    *mode = ReplMode::Raw;
                    return ReplExit::SwitchMode;
                }
                Read::Control(CTRL_B) => {
                    console.write("\r\n");
                    continue 'reset;
                }
                Read::Control(CTRL_D) => {
                    console.write("\r\n");
                    return ReplExit::SoftReset;
                }
                Read::Control(_) => {
                    console.write("\r\n");
                    continue 'input;
                }
                Read::Line if line.is_empty() => continue 'input,
                Read::Line => {}
            }

            while needs_more_input(&line) {
                line.push('\n');
                match reader.read(console, "... ", &mut line) {
                    Read::Eof => return ReplExit::SoftReset,
                    Read::Control(CTRL_C) => {
                        console.write("\r\n");
                        continue 'input;
                    }
                    Read::Control(CTRL_D) => break,
                    Read::Control(_) | Read::Line => {}
                }
            }

            if let Outcome::SystemExit = execute(vm, console, &line, Mode::Single, false) {
                return ReplExit::SoftReset;
            }
        }
    }
}

/// Runs `boot` if given, then alternates between the two loops, starting
/// with `mode`, until one asks for a soft reset.
pub(crate) fn auto_repl(
    vm: &mut Vm,
    console: &mut dyn Console,
    mode: &mut ReplMode,
    name: &str,
    boot: Option<&str>,
) -> ReplExit {
    if let Some(source) = boot {
        if let Some(exit) = execute_module(vm, console, source) {
            return exit;
        }
    }
    loop {
        let exit = match *mode {
            ReplMode::Raw => raw_repl(vm, console, mode),
            ReplMode::Friendly => friendly_repl(vm, console, mode, name),
        };
        if exit == ReplExit::SoftReset {
            return exit;
        }
    }
}
