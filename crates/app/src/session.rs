use std::{
    io::{BufRead, Write},
    time::Duration,
};

use beatlight_core::{
    color::NAMED_COLORS, device::BUILTIN_EFFECTS, Bpm, DeviceCommand, EffectKind, EffectSpec,
    Result, Rgb, ShowHandle,
};
use tokio::{sync::mpsc, time::Instant};

use crate::console::{ConsoleCommand, HELP};

/// How long the console waits for the show to confirm a tempo change.
const CONFIRM_WAIT: Duration = Duration::from_millis(150);

/// A line of input, stamped when it was read rather than when it is handled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsoleLine {
    pub at: Instant,
    pub text: String,
}

impl ConsoleLine {
    pub fn now(text: impl Into<String>) -> Self {
        Self {
            at: Instant::now(),
            text: text.into(),
        }
    }
}

/// Reads stdin on its own thread. A blocking read cannot be cancelled, so it
/// must not live on the runtime; the thread is simply left behind on exit.
fn spawn_stdin_reader() -> Result<mpsc::UnboundedReceiver<std::io::Result<ConsoleLine>>> {
    let (tx, rx) = mpsc::unbounded_channel();
    std::thread::Builder::new()
        .name("stdin-reader".into())
        .spawn(move || {
            for line in std::io::stdin().lock().lines() {
                let failed = line.is_err();
                if tx.send(line.map(ConsoleLine::now)).is_err() || failed {
                    break;
                }
            }
        })?;
    Ok(rx)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Quit,
}

/// Interactive front end for a running show.
pub struct Console {
    show: ShowHandle,
    power: bool,
    builtin: usize,
    tapping: Option<usize>,
    /// Effect to restore when the strobe toggle is switched off.
    before_strobe: Option<Option<EffectSpec>>,
}

impl Console {
    pub fn new(show: ShowHandle) -> Self {
        Self {
            show,
            power: true,
            builtin: 0,
            tapping: None,
            before_strobe: None,
        }
    }

    /// Reads commands from stdin until `q`, end of input or Ctrl-C.
    pub async fn run(&mut self) -> Result<()> {
        let mut lines = spawn_stdin_reader()?;
        println!("{HELP}\n");
        println!("Current tempo: {}", self.show.context().bpm);
        println!("Current colors: {}", format_colors(&self.show.context().palette));

        // Created once so an interrupt during a command is not lost.
        let interrupted = tokio::signal::ctrl_c();
        tokio::pin!(interrupted);

        loop {
            prompt(self.tapping.is_some());
            let line = tokio::select! {
                line = lines.recv() => line,
                _ = &mut interrupted => {
                    println!();
                    None
                }
            };
            let Some(line) = line else {
                break;
            };

            if self.handle_line(line?).await? == Flow::Quit {
                break;
            }
        }
        Ok(())
    }

    async fn handle_line(&mut self, line: ConsoleLine) -> Result<Flow> {
        if let Some(taps) = self.tapping {
            return self.handle_tap_line(line, taps).await.map(|_| Flow::Continue);
        }

        match ConsoleCommand::parse(&line.text) {
            Ok(Some(command)) => self.handle(command).await,
            Ok(None) => Ok(Flow::Continue),
            Err(err) => {
                println!("{err}");
                Ok(Flow::Continue)
            }
        }
    }

    async fn handle_tap_line(&mut self, line: ConsoleLine, taps: usize) -> Result<()> {
        if !line.text.trim().is_empty() {
            self.tapping = None;
            println!("Left tap mode. Tempo: {}", self.show.context().bpm);
            return Ok(());
        }

        let taps = taps + 1;
        self.tapping = Some(taps);
        let before = self.show.context().bpm;
        self.show.tap_at(line.at).await?;
        if taps < 2 {
            println!("Tap {taps}/2... (keep tapping)");
        } else {
            let bpm = self.tempo_after(before).await.unwrap_or(before);
            println!("Tempo: {bpm} (from {taps} taps)");
        }
        Ok(())
    }

    async fn handle(&mut self, command: ConsoleCommand) -> Result<Flow> {
        match command {
            ConsoleCommand::Quit => return Ok(Flow::Quit),
            ConsoleCommand::Help => println!("{HELP}"),
            ConsoleCommand::CycleEffect => {
                let name = BUILTIN_EFFECTS[self.builtin % BUILTIN_EFFECTS.len()];
                self.builtin += 1;
                self.show
                    .command(DeviceCommand::Effect {
                        name: name.to_string(),
                        speed: 100,
                    })
                    .await?;
                println!("Effect: {name}");
            }
            ConsoleCommand::TogglePower => {
                self.power = !self.power;
                self.show
                    .command(DeviceCommand::Power { on: self.power })
                    .await?;
                println!("Power: {}", if self.power { "ON" } else { "OFF" });
            }
            ConsoleCommand::Color(color) => {
                self.show
                    .command(DeviceCommand::Color {
                        color,
                        brightness: 100,
                    })
                    .await?;
                println!("Color set to: {color}");
            }
            ConsoleCommand::Flash => {
                self.show.flash().await?;
                println!("Flash");
            }
            ConsoleCommand::ToggleStrobe => match self.before_strobe.take() {
                Some(previous) => {
                    match previous {
                        Some(effect) => self.show.set_effect(effect).await?,
                        None => self.show.stop_effect().await?,
                    }
                    println!("Strobe OFF");
                }
                None => {
                    self.before_strobe = Some(self.show.context().effect.clone());
                    let strobe = EffectSpec::new(EffectKind::Strobe).with_colors(vec![Rgb::WHITE]);
                    self.show.set_effect(strobe).await?;
                    println!("Strobe ON");
                }
            },
            ConsoleCommand::DoubleTempo => {
                let before = self.show.context().bpm;
                self.show.scale_tempo(2.0).await?;
                self.report_tempo(before).await;
            }
            ConsoleCommand::HalveTempo => {
                let before = self.show.context().bpm;
                self.show.scale_tempo(0.5).await?;
                self.report_tempo(before).await;
            }
            ConsoleCommand::SetColors(colors) => {
                println!("Colors set to: {}", format_colors(&colors));
                self.show.set_palette(colors).await?;
            }
            ConsoleCommand::ShowColors => {
                println!("Current colors: {}", format_colors(&self.show.context().palette));
            }
            ConsoleCommand::Palette => {
                println!("Available color names:");
                for (name, color) in NAMED_COLORS {
                    println!("  {name:12} - {color}");
                }
            }
            ConsoleCommand::Effect { kind, colors } => {
                self.before_strobe = None;
                let effect = EffectSpec::new(kind).with_colors(colors);
                println!("Starting {effect} at {}", self.show.context().bpm);
                self.show.set_effect(effect).await?;
            }
            ConsoleCommand::Tap => {
                self.tapping = Some(0);
                println!("--- Tap Tempo Mode ---");
                println!("Press Enter on every beat; type anything else to leave.");
            }
            ConsoleCommand::SetTempo(bpm) => {
                let before = self.show.context().bpm;
                self.show.set_tempo(bpm).await?;
                self.report_tempo(before).await;
            }
            ConsoleCommand::ShowTempo => println!("Current tempo: {}", self.show.context().bpm),
            ConsoleCommand::Stop => {
                self.before_strobe = None;
                self.show.stop_effect().await?;
                println!("Stopped");
            }
            ConsoleCommand::Stats => {
                let status = self.show.status();
                println!("{}", status.latency);
                println!(
                    "compensation={:.1}ms, dispatched={}, failed={}, skipped beats={}",
                    status.compensation.as_secs_f64() * 1000.0,
                    status.dispatched,
                    status.failures,
                    status.skipped_beats
                );
            }
        }
        Ok(Flow::Continue)
    }

    async fn report_tempo(&mut self, before: Bpm) {
        match self.tempo_after(before).await {
            Some(bpm) => println!("Tempo: {bpm}"),
            None => println!("Tempo unchanged: {before} (see log for details)"),
        }
    }

    /// Waits briefly for the show to move away from `before`.
    async fn tempo_after(&mut self, before: Bpm) -> Option<Bpm> {
        let show = &mut self.show;
        let changed = async {
            loop {
                match show.context_changed().await {
                    Ok(context) if context.bpm != before => return Some(context.bpm),
                    Ok(_) => continue,
                    Err(_) => return None,
                }
            }
        };
        tokio::time::timeout(CONFIRM_WAIT, changed).await.ok().flatten()
    }

    pub fn into_handle(self) -> ShowHandle {
        self.show
    }
}

fn prompt(tapping: bool) {
    print!("{}", if tapping { "tap> " } else { "\n$: " });
    let _ = std::io::stdout().flush();
}

fn format_colors(colors: &[Rgb]) -> String {
    let hex: Vec<String> = colors.iter().map(|color| color.to_hex()).collect();
    format!("[{}]", hex.join(", "))
}

#[cfg(test)]
mod tests {
    use std::{future::Future, sync::Arc};

    use beatlight_core::{spawn_show, AppConfig, DeviceAck, LightDevice, ShowContext};

    use super::*;

    const RED: Rgb = Rgb::new(255, 0, 0);

    struct QuietDevice;

    impl LightDevice for QuietDevice {
        fn send(&self, _: &DeviceCommand) -> impl Future<Output = Result<DeviceAck>> + Send {
            std::future::ready(Ok(DeviceAck {
                elapsed: Duration::ZERO,
            }))
        }
    }

    fn console() -> (Console, ShowHandle) {
        let (show, _task) = spawn_show(QuietDevice, &AppConfig::default()).unwrap();
        (Console::new(show.clone()), show)
    }

    async fn wait_for(
        show: &mut ShowHandle,
        check: impl Fn(&ShowContext) -> bool,
    ) -> Arc<ShowContext> {
        let reached = async {
            loop {
                let context = show.context();
                if check(&context) {
                    return context;
                }
                show.context_changed().await.unwrap();
            }
        };
        tokio::time::timeout(Duration::from_secs(2), reached)
            .await
            .expect("show context did not reach the expected state")
    }

    fn effect_kind(context: &ShowContext) -> Option<EffectKind> {
        context.effect.as_ref().map(|effect| effect.kind)
    }

    #[tokio::test]
    async fn strobe_toggle_restores_the_previous_effect() {
        let (mut console, mut show) = console();

        console
            .handle(ConsoleCommand::Effect {
                kind: EffectKind::Fade,
                colors: vec![RED],
            })
            .await
            .unwrap();
        wait_for(&mut show, |c| effect_kind(c) == Some(EffectKind::Fade)).await;

        console.handle(ConsoleCommand::ToggleStrobe).await.unwrap();
        wait_for(&mut show, |c| effect_kind(c) == Some(EffectKind::Strobe)).await;

        console.handle(ConsoleCommand::ToggleStrobe).await.unwrap();
        let context = wait_for(&mut show, |c| effect_kind(c) == Some(EffectKind::Fade)).await;
        assert_eq!(context.effect.as_ref().unwrap().colors, vec![RED]);
    }

    #[tokio::test]
    async fn strobe_toggle_from_silence_stops_again() {
        let (mut console, mut show) = console();

        console.handle(ConsoleCommand::ToggleStrobe).await.unwrap();
        wait_for(&mut show, |c| effect_kind(c) == Some(EffectKind::Strobe)).await;

        console.handle(ConsoleCommand::ToggleStrobe).await.unwrap();
        wait_for(&mut show, |c| c.effect.is_none()).await;
    }

    #[tokio::test]
    async fn tap_mode_uses_read_timestamps() {
        let (mut console, mut show) = console();
        console.handle(ConsoleCommand::Tap).await.unwrap();
        assert_eq!(console.tapping, Some(0));

        let first = Instant::now();
        for n in 0..4u32 {
            let line = ConsoleLine {
                at: first + Duration::from_millis(400) * n,
                text: String::new(),
            };
            console.handle_line(line).await.unwrap();
        }
        assert_eq!(console.tapping, Some(4));
        let context = wait_for(&mut show, |c| (c.bpm.value() - 150.0).abs() < 1e-6).await;
        assert!((context.bpm.value() - 150.0).abs() < 1e-6);

        console.handle_line(ConsoleLine::now("x")).await.unwrap();
        assert_eq!(console.tapping, None);
    }

    #[tokio::test]
    async fn quit_ends_the_session() {
        let (mut console, _show) = console();
        let flow = console.handle_line(ConsoleLine::now("q")).await.unwrap();
        assert_eq!(flow, Flow::Quit);
    }
}
