use crate::board::Board;
use crate::command::CommandExecutor;
use crate::config::{Config, InterruptMapping, SpiConfig};
use crate::hardware::HardwareSpi;
use crate::interrupt::InterruptDispatcher;
use crate::pin::{Direction, PinDevice, SysfsPin};
use crate::soft::SoftSpi;
use anyhow::{Context, Result};
use log::{info, warn};

pub struct Daemon {
    config: Config,
    board: Board,
    dispatcher: InterruptDispatcher,
    watched: Vec<SysfsPin>,
}

impl Daemon {
    pub fn new(config: Config) -> Result<Self> {
        let board = Board::detect(&config.board).context("Failed to detect board")?;

        let mut daemon = Daemon {
            config,
            board,
            dispatcher: InterruptDispatcher::new(),
            watched: Vec::new(),
        };
        daemon.init()?;
        Ok(daemon)
    }

    fn init(&mut self) -> Result<()> {
        if let Some(spi) = &self.config.spi {
            Self::run_startup_transfer(&self.board, spi)?;
        }

        info!("Monitoring {} interrupt pin(s)", self.config.interrupts.len());
        for mapping in &self.config.interrupts {
            let pin = Self::watch(&self.board, &self.dispatcher, mapping)?;
            info!("  - {}: {:?}", pin, mapping.description);
            self.watched.push(pin);
        }
        Ok(())
    }

    fn run_startup_transfer(board: &Board, spi: &SpiConfig) -> Result<()> {
        if let Some(bus) = &spi.hardware {
            let mut engine = HardwareSpi::configure(bus.clone())
                .context("SPI initialization error")?;
            info!("SPI device initialized: {}", engine);
            if !spi.startup_words.is_empty() {
                let received = engine
                    .transfer(&spi.startup_words)
                    .context("Start-up transfer failed")?;
                info!("Start-up transfer received {:02x?}", received);
            }
            engine.close();
        } else if let Some(soft) = &spi.soft {
            let mut builder = SoftSpi::builder()
                .clock(board.pin(soft.clock))
                .polarity(soft.polarity)
                .phase(soft.phase)
                .word_size(soft.word_size);
            if let Some(output) = soft.output {
                builder = builder.output(board.pin(output));
            }
            if let Some(input) = soft.input {
                builder = builder.input(board.pin(input));
            }
            let mut engine = builder.build().context("Soft SPI initialization error")?;
            if !spi.startup_words.is_empty() {
                engine
                    .write(&spi.startup_words)
                    .context("Start-up write failed")?;
                info!("Start-up write of {} words done", spi.startup_words.len());
            }
        }
        Ok(())
    }

    fn watch(
        board: &Board,
        dispatcher: &InterruptDispatcher,
        mapping: &InterruptMapping,
    ) -> Result<SysfsPin> {
        let pin = board.pin(mapping.pin);
        if !pin.exists() {
            pin.export()?;
        }
        pin.set_direction(Direction::Input)?;
        pin.set_edge(mapping.edge)?;
        pin.set_active_low(mapping.active_low)?;

        let name = pin.name().to_string();
        let command = mapping.command.clone();
        let timeout_secs = mapping.timeout_secs;
        dispatcher
            .register_callback(&pin, move |value| {
                info!("Edge on {}: value={}", name, value);
                let Some(command) = &command else {
                    return;
                };
                let env = [("CHIP_GPIO_PIN", name.as_str()), ("CHIP_GPIO_VALUE", value)];
                let result = match timeout_secs {
                    Some(secs) => CommandExecutor::execute_with_timeout(command, &env, secs),
                    None => CommandExecutor::execute(command, &env),
                };
                if let Err(e) = result {
                    warn!("Failed to execute command for {}: {}", name, e);
                }
            })
            .with_context(|| format!("Failed to watch {}", pin))?;
        Ok(pin)
    }

    pub fn watched(&self) -> &[SysfsPin] {
        &self.watched
    }

    pub fn is_watching(&self, pin: &SysfsPin) -> bool {
        self.dispatcher.is_waiting(pin)
    }

    /// Stop every watcher. Errors from dead loops are reported, not fatal.
    pub fn shutdown(&mut self) {
        for pin in self.watched.drain(..) {
            if let Err(e) = self.dispatcher.cancel(&pin) {
                warn!("Stopping watch on {}: {}", pin, e);
            }
        }
    }

    /// Swap in `new_config`. If the new board can't be resolved the current
    /// watchers are left running. A failure while watching the new pins
    /// leaves whatever was set up before it.
    pub fn reload_config(&mut self, new_config: Config) -> Result<()> {
        let board = Board::detect(&new_config.board).context("Failed to detect board")?;
        self.shutdown();
        self.board = board;
        self.config = new_config;
        self.init()?;
        info!("Configuration reloaded successfully");
        Ok(())
    }
}

impl Drop for Daemon {
    fn drop(&mut self) {
        self.shutdown();
    }
}
