use beatlight_core::{BeatLightError, EffectKind, Result, Rgb};

pub const HELP: &str = "\
Commands:
  e                     cycle the controller's built-in effects
  p                     toggle power
  #RRGGBB | name        set a static color (e.g. 'red', 'cyan', '#ff0000')
  f                     single white flash
  s                     toggle strobe on or off
  ]  /  [               double / halve the tempo
  colors [c1 c2 ...]    show or set the session palette
  palette               list the named colors
  swell|fade|transition|switch|strobe|pulse [c1 c2 ...]
                        run a beat-synced effect (palette when no colors)
  beat                  flash on every beat
  tap                   tap tempo: press Enter on the beat, any text to leave
  tempo [bpm]           show or set the tempo
  stop                  stop the running effect
  stats                 latency and dispatch statistics
  help                  show this help
  q                     quit";

/// One line of console input.
#[derive(Debug, Clone, PartialEq)]
pub enum ConsoleCommand {
    Quit,
    Help,
    CycleEffect,
    TogglePower,
    Color(Rgb),
    Flash,
    ToggleStrobe,
    DoubleTempo,
    HalveTempo,
    SetColors(Vec<Rgb>),
    ShowColors,
    Palette,
    Effect { kind: EffectKind, colors: Vec<Rgb> },
    Tap,
    SetTempo(f64),
    ShowTempo,
    Stop,
    Stats,
}

impl ConsoleCommand {
    /// Parses a console line. Blank lines yield `None`.
    pub fn parse(line: &str) -> Result<Option<Self>> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(None);
        }

        let command = match line {
            "q" | "quit" => Self::Quit,
            "help" | "?" => Self::Help,
            "e" => Self::CycleEffect,
            "p" => Self::TogglePower,
            "f" => Self::Flash,
            "s" => Self::ToggleStrobe,
            "]" => Self::DoubleTempo,
            "[" => Self::HalveTempo,
            "palette" => Self::Palette,
            "tap" => Self::Tap,
            "stop" => Self::Stop,
            "stats" => Self::Stats,
            _ if line.starts_with('#') || beatlight_core::color::named(line).is_some() => {
                Self::Color(Rgb::parse(line)?)
            }
            _ => return Self::parse_with_arguments(line).map(Some),
        };
        Ok(Some(command))
    }

    fn parse_with_arguments(line: &str) -> Result<Self> {
        let mut parts = line.split_whitespace();
        let keyword = parts.next().unwrap_or_default();
        let rest: Vec<&str> = parts.collect();

        match keyword {
            "colors" if rest.is_empty() => Ok(Self::ShowColors),
            "colors" => Ok(Self::SetColors(parse_colors(&rest)?)),
            "tempo" => match rest.first() {
                None => Ok(Self::ShowTempo),
                Some(value) => value
                    .parse::<f64>()
                    .map(Self::SetTempo)
                    .map_err(|_| BeatLightError::msg(format!("invalid tempo value `{value}`"))),
            },
            other => {
                let kind: EffectKind = other
                    .parse()
                    .map_err(|_| BeatLightError::msg(format!("unknown command `{line}`")))?;
                Ok(Self::Effect {
                    kind,
                    colors: parse_colors(&rest)?,
                })
            }
        }
    }
}

fn parse_colors(words: &[&str]) -> Result<Vec<Rgb>> {
    words.iter().map(|word| Rgb::parse(word)).collect()
}
