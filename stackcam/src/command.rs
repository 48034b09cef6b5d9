//! Parsing of command lines received from clients.

use stackcam_types::{ExposureLimits, GainMode, Verb};

use crate::{Error, Result};

/// A validated client command.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Image,
    Etime(f64),
    Gain(GainMode),
    Quit,
}

impl Command {
    pub fn verb(&self) -> Verb {
        match self {
            Command::Image => Verb::Image,
            Command::Etime(_) => Verb::Etime,
            Command::Gain(_) => Verb::Gain,
            Command::Quit => Verb::Quit,
        }
    }

    /// Parse one command line.
    ///
    /// Errors are [Error::Validation]; their `verb` is `None` when the line
    /// is not recognizable as any command.
    pub fn parse(line: &str, limits: &ExposureLimits) -> Result<Self> {
        let tokens = tokenize(line);
        let Some((first, args)) = tokens.split_first() else {
            return Err(syntax_error());
        };
        let verb = Verb::from_token(first).ok_or_else(syntax_error)?;

        match verb {
            Verb::Image | Verb::Quit => {
                if !args.is_empty() {
                    return Err(syntax_error());
                }
                Ok(if verb == Verb::Image {
                    Command::Image
                } else {
                    Command::Quit
                })
            }
            Verb::Etime => {
                let arg = single_arg(verb, args)?;
                let etime: f64 = arg
                    .parse()
                    .map_err(|_| Error::validation(verb, "Invalid argument specified"))?;
                if !limits.contains(etime) {
                    return Err(Error::validation(verb, "Invalid exposure time specified"));
                }
                Ok(Command::Etime(etime))
            }
            Verb::Gain => {
                let arg = single_arg(verb, args)?;
                let gain: GainMode = arg
                    .parse()
                    .map_err(|_| Error::validation(verb, "Invalid gain argument specified"))?;
                Ok(Command::Gain(gain))
            }
        }
    }
}

fn syntax_error() -> Error {
    Error::Validation {
        verb: None,
        reason: "Syntax error".into(),
    }
}

fn single_arg(verb: Verb, args: &[String]) -> Result<&str> {
    match args {
        [] => Err(Error::validation(verb, "Argument not specified")),
        [arg] => Ok(arg.as_str()),
        _ => Err(Error::validation(verb, "Invalid argument specified")),
    }
}

/// Split a line into whitespace separated tokens.
///
/// Text between double quotes is part of one token, including its
/// whitespace; the quotes themselves are removed. `""` is an empty token.
pub fn tokenize(line: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current: Option<String> = None;
    let mut quoted = false;

    for c in line.chars() {
        if c == '"' {
            quoted = !quoted;
            current.get_or_insert_with(String::new);
        } else if c.is_whitespace() && !quoted {
            if let Some(token) = current.take() {
                tokens.push(token);
            }
        } else {
            current.get_or_insert_with(String::new).push(c);
        }
    }
    if let Some(token) = current {
        tokens.push(token);
    }
    tokens
}

#[cfg(test)]
mod test {
    use super::*;

    fn parse(line: &str) -> Result<Command> {
        Command::parse(line, &ExposureLimits::default())
    }

    fn reason(result: Result<Command>) -> (Option<Verb>, String) {
        match result {
            Err(Error::Validation { verb, reason }) => (verb, reason),
            other => panic!("expected a validation error, got {other:?}"),
        }
    }

    #[test]
    fn tokens() {
        assert_eq!(tokenize("  ETIME   2.5 "), vec!["ETIME", "2.5"]);
        assert_eq!(tokenize("GAIN \"high\""), vec!["GAIN", "high"]);
        assert_eq!(tokenize("a \"b c\" d"), vec!["a", "b c", "d"]);
        assert_eq!(tokenize("x\"y z\"w"), vec!["xy zw"]);
        assert_eq!(tokenize("ETIME \"\""), vec!["ETIME", ""]);
        assert!(tokenize("").is_empty());
        assert!(tokenize(" \t ").is_empty());
    }

    #[test]
    fn valid_commands() {
        assert_eq!(parse("IMAGE").unwrap(), Command::Image);
        assert_eq!(parse("image").unwrap(), Command::Image);
        assert_eq!(parse("ETIME 2.5").unwrap(), Command::Etime(2.5));
        assert_eq!(parse("etime 0.1").unwrap(), Command::Etime(0.1));
        assert_eq!(parse("ETIME 600").unwrap(), Command::Etime(600.0));
        assert_eq!(parse("GAIN low").unwrap(), Command::Gain(GainMode::Low));
        assert_eq!(parse("GAIN \"MANUAL\"").unwrap(), Command::Gain(GainMode::Manual));
        for quit in ["QUIT", "bye", "Exit", "LOGOUT"] {
            assert_eq!(parse(quit).unwrap(), Command::Quit);
        }
    }

    #[test]
    fn etime_errors() {
        let e = Some(Verb::Etime);
        assert_eq!(reason(parse("ETIME")), (e, "Argument not specified".into()));
        assert_eq!(
            reason(parse("ETIME 1 2")),
            (e, "Invalid argument specified".into())
        );
        assert_eq!(
            reason(parse("ETIME fast")),
            (e, "Invalid argument specified".into())
        );
        assert_eq!(
            reason(parse("ETIME \"\"")),
            (e, "Invalid argument specified".into())
        );
        for bad in ["0.05", "0", "-1", "600.5", "nan", "inf"] {
            assert_eq!(
                reason(parse(&format!("ETIME {bad}"))),
                (e, "Invalid exposure time specified".into()),
                "{bad}"
            );
        }
    }

    #[test]
    fn gain_errors() {
        let g = Some(Verb::Gain);
        assert_eq!(reason(parse("GAIN")), (g, "Argument not specified".into()));
        assert_eq!(
            reason(parse("GAIN LOW HIGH")),
            (g, "Invalid argument specified".into())
        );
        assert_eq!(
            reason(parse("GAIN medium")),
            (g, "Invalid gain argument specified".into())
        );
    }

    #[test]
    fn syntax_errors() {
        for line in ["", "   ", "FOCUS 3", "IMAGE now", "QUIT please", "\"\""] {
            assert_eq!(reason(parse(line)), (None, "Syntax error".into()), "{line:?}");
        }
    }
}
