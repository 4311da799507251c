//! Single-character debug console.
//!
//! Input is consumed one byte at a time so the loop never waits on the
//! operator. The two-line `S` prompt is a small state machine instead of a
//! blocking read.

use crate::hal::ConsoleIo;

pub const HELP: &str = "\n\nCommands:\n\n\
T = Transmit Received Code\n\
H = Received History\n\
C = Current Timestamp\n\
D = Disconnect WiFi\n\
F = Filesystem Info\n\
S - Set SSID / Password\n\
L = Reload Config\n\
W = Wipe Config\n\
X = Close Session\n\
R = Reboot ESP\n\n";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
    TransmitLast,
    ShowHistory,
    ShowTimestamp,
    DisconnectWifi,
    FilesystemInfo,
    SetCredentials { ssid: String, password: String },
    ReloadConfig,
    WipeConfig,
    CloseSession,
    Reboot,
    Help,
}

#[derive(Debug, Default)]
enum Prompt {
    #[default]
    Command,
    /// `fresh` holds until the first byte after `S`, so a line end still
    /// trailing the command itself does not answer the prompt.
    Ssid { input: Vec<u8>, fresh: bool },
    Password { ssid: String, password: Vec<u8> },
}

#[derive(Debug, Default)]
pub struct Console {
    prompt: Prompt,
    after_cr: bool,
}

impl Console {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_prompting(&self) -> bool {
        !matches!(self.prompt, Prompt::Command)
    }

    /// Drains the bytes currently available and returns the completed commands.
    pub fn poll(&mut self, io: &mut impl ConsoleIo) -> Vec<ConsoleCommand> {
        let mut commands = Vec::new();
        while let Some(byte) = io.read_byte() {
            if let Some(command) = self.feed(byte, io) {
                commands.push(command);
            }
        }
        commands
    }

    pub fn feed(&mut self, byte: u8, io: &mut impl ConsoleIo) -> Option<ConsoleCommand> {
        let after_cr = std::mem::replace(&mut self.after_cr, byte == b'\r');

        match std::mem::take(&mut self.prompt) {
            Prompt::Command => self.command(byte, io),
            Prompt::Ssid { mut input, fresh } => {
                if is_line_end(byte) {
                    // Rest of the `S` line, or the LF of its CRLF.
                    if input.is_empty() && (fresh || (byte == b'\n' && after_cr)) {
                        self.prompt = Prompt::Ssid {
                            input,
                            fresh: false,
                        };
                        return None;
                    }
                    io.write_str("\nType PASSWORD and press <ENTER>\n");
                    self.prompt = Prompt::Password {
                        ssid: String::from_utf8_lossy(&input).into_owned(),
                        password: Vec::new(),
                    };
                } else {
                    io.write_bytes(&[byte]);
                    input.push(byte);
                    self.prompt = Prompt::Ssid {
                        input,
                        fresh: false,
                    };
                }
                None
            }
            Prompt::Password { ssid, mut password } => {
                if is_line_end(byte) {
                    // The LF of a CRLF that ended the SSID line.
                    if byte == b'\n' && after_cr && password.is_empty() {
                        self.prompt = Prompt::Password { ssid, password };
                        return None;
                    }
                    let password = String::from_utf8_lossy(&password).into_owned();
                    io.write_str(&format!("\n\nSSID=[{ssid}] PWD=[{password}]\n\n"));
                    return Some(ConsoleCommand::SetCredentials { ssid, password });
                }
                io.write_bytes(&[byte]);
                password.push(byte);
                self.prompt = Prompt::Password { ssid, password };
                None
            }
        }
    }

    fn command(&mut self, byte: u8, io: &mut impl ConsoleIo) -> Option<ConsoleCommand> {
        let command = match byte {
            b'\r' => {
                io.write_str("\r");
                return None;
            }
            b'\n' => {
                io.write_str("\n");
                return None;
            }
            b' ' => return None,
            b'S' => {
                io.write_str("\nType SSID and press <ENTER>\n");
                self.prompt = Prompt::Ssid {
                    input: Vec::new(),
                    fresh: true,
                };
                return None;
            }
            b'T' => ConsoleCommand::TransmitLast,
            b'H' => ConsoleCommand::ShowHistory,
            b'C' => ConsoleCommand::ShowTimestamp,
            b'D' => ConsoleCommand::DisconnectWifi,
            b'F' => ConsoleCommand::FilesystemInfo,
            b'L' => ConsoleCommand::ReloadConfig,
            b'W' => ConsoleCommand::WipeConfig,
            b'X' => ConsoleCommand::CloseSession,
            b'R' => ConsoleCommand::Reboot,
            _ => ConsoleCommand::Help,
        };
        Some(command)
    }
}

fn is_line_end(byte: u8) -> bool {
    byte == b'\r' || byte == b'\n'
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::testing::ScriptedConsole;

    fn run(input: &str) -> (Vec<ConsoleCommand>, String) {
        let mut io = ScriptedConsole::default();
        io.type_text(input);
        let mut console = Console::new();
        let commands = console.poll(&mut io);
        (commands, io.take_output())
    }

    #[test]
    fn single_letters_map_to_commands() {
        let (commands, _) = run("THCDFLWXR");
        assert_eq!(
            commands,
            vec![
                ConsoleCommand::TransmitLast,
                ConsoleCommand::ShowHistory,
                ConsoleCommand::ShowTimestamp,
                ConsoleCommand::DisconnectWifi,
                ConsoleCommand::FilesystemInfo,
                ConsoleCommand::ReloadConfig,
                ConsoleCommand::WipeConfig,
                ConsoleCommand::CloseSession,
                ConsoleCommand::Reboot,
            ]
        );
    }

    #[test]
    fn whitespace_is_echo_only_and_unknown_input_asks_for_help() {
        let (commands, output) = run(" \r\nq");
        assert_eq!(commands, vec![ConsoleCommand::Help]);
        assert_eq!(output, "\r\n");
    }

    #[test]
    fn set_credentials_prompts_for_two_lines() {
        let (commands, output) = run("SHomeNet\r\nsecret\r\n");
        assert_eq!(
            commands,
            vec![ConsoleCommand::SetCredentials {
                ssid: "HomeNet".to_string(),
                password: "secret".to_string(),
            }]
        );
        assert!(output.starts_with("\nType SSID and press <ENTER>\nHomeNet"));
        assert!(output.contains("\nType PASSWORD and press <ENTER>\nsecret"));
        assert!(output.contains("SSID=[HomeNet] PWD=[secret]\n\n"));
    }

    #[test]
    fn prompt_survives_partial_input_across_polls() {
        let mut io = ScriptedConsole::default();
        let mut console = Console::new();

        io.type_text("SHome");
        assert!(console.poll(&mut io).is_empty());
        assert!(console.is_prompting());

        io.type_text("Net\rpw\r");
        assert_eq!(
            console.poll(&mut io),
            vec![ConsoleCommand::SetCredentials {
                ssid: "HomeNet".to_string(),
                password: "pw".to_string(),
            }]
        );
        assert!(!console.is_prompting());
    }

    #[test]
    fn empty_answers_clear_credentials() {
        let (commands, _) = run("S\n\n\n");
        assert_eq!(
            commands,
            vec![ConsoleCommand::SetCredentials {
                ssid: String::new(),
                password: String::new(),
            }]
        );
    }

    #[test]
    fn line_buffered_input_answers_both_prompts() {
        let (commands, output) = run("S\nHomeNet\nsecret\n");
        assert_eq!(
            commands,
            vec![ConsoleCommand::SetCredentials {
                ssid: "HomeNet".to_string(),
                password: "secret".to_string(),
            }]
        );
        assert!(output.ends_with("SSID=[HomeNet] PWD=[secret]\n\n"));
    }

    #[test]
    fn crlf_after_the_command_is_swallowed_once() {
        let (commands, _) = run("S\r\nHomeNet\r\nsecret\r\n");
        assert_eq!(
            commands,
            vec![ConsoleCommand::SetCredentials {
                ssid: "HomeNet".to_string(),
                password: "secret".to_string(),
            }]
        );
    }

    #[test]
    fn utf8_answers_are_kept_and_echoed_intact() {
        let (commands, output) = run("SCafé\rpässwörd\r");
        assert_eq!(
            commands,
            vec![ConsoleCommand::SetCredentials {
                ssid: "Café".to_string(),
                password: "pässwörd".to_string(),
            }]
        );
        assert!(output.contains("\nType SSID and press <ENTER>\nCafé\n"));
        assert!(output.contains("SSID=[Café] PWD=[pässwörd]"));
    }

    #[test]
    fn letters_inside_prompt_are_not_commands() {
        let (commands, _) = run("SRT\rX\rR");
        assert_eq!(
            commands,
            vec![
                ConsoleCommand::SetCredentials {
                    ssid: "RT".to_string(),
                    password: "X".to_string(),
                },
                ConsoleCommand::Reboot,
            ]
        );
    }
}
