#[macro_use]
extern crate tracing;

use std::io;
use std::os::fd::AsFd;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{anyhow, ensure, Context, Result};
use calloop::generic::Generic;
use calloop::{EventLoop, Interest, Mode, PostAction};
use calloop_wayland_source::WaylandSource;
use clap::Parser;
use shroud::cli::Cli;
use shroud::devices::{self, LibinputSource};
use shroud::escape::EscapeCombo;
use shroud::state::{ExitReason, State};
use wayland_client::backend::WaylandError;
use wayland_client::Connection;

fn main() -> ExitCode {
    if let Ok(env_filter) = tracing_subscriber::EnvFilter::try_from_default_env() {
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    } else {
        tracing_subscriber::fmt().init();
    }

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            // Usage errors exit 1; --help and --version exit 0.
            let code: u8 = if err.use_stderr() { 1 } else { 0 };
            err.print().ok();
            return ExitCode::from(code);
        }
    };

    match run(cli) {
        Ok(reason) => {
            match reason {
                ExitReason::EscapeCombo => info!("exiting on the escape key combination"),
                ExitReason::CompositorGone => info!("compositor connection closed, exiting"),
                ExitReason::TimestampOverflow => {
                    info!("32-bit replay timestamp range exhausted; restart to continue")
                }
            }
            ExitCode::SUCCESS
        }
        Err(err) => {
            error!("FATAL ERROR: {err:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<ExitReason> {
    ensure!(unsafe { libc::getuid() } == 0, "must be run as root");

    // Keep locales from affecting anything string-shaped.
    std::env::set_var("LC_ALL", "C");

    let escape = EscapeCombo::parse(&cli.esc_key_combo)?;

    // Give the compositor time to finish starting up before we connect.
    std::thread::sleep(Duration::from_millis(cli.start_delay as u64));

    let conn =
        Connection::connect_to_env().context("could not connect to the Wayland display")?;

    let mut event_loop: EventLoop<State> =
        EventLoop::try_new().context("could not create the event loop")?;

    let (mut state, mut event_queue) =
        State::new(&cli, escape, &conn, event_loop.get_signal())?;

    // First roundtrip settles the seat (and surfaces an authorization
    // error for the virtual keyboard); the second delivers the keymap,
    // output geometries, and layer configures that the first set up.
    for _ in 0..2 {
        event_queue
            .roundtrip(&mut state)
            .map_err(virtual_keyboard_unauthorized)?;
        state.turn()?;
    }
    ensure!(
        state.keyboard.is_some(),
        "no wl_keyboard object from compositor"
    );

    state.devices.scan()?;
    let hotplug_fd = devices::init_hotplug_watch()?;

    let handle = event_loop.handle();
    WaylandSource::new(conn.clone(), event_queue)
        .insert(handle.clone())
        .map_err(|err| anyhow!("could not insert the Wayland event source: {err}"))?;

    handle
        .insert_source(
            Generic::new(
                LibinputSource(state.devices.context.clone()),
                Interest::READ,
                Mode::Level,
            ),
            |_, _, state: &mut State| -> io::Result<PostAction> {
                if let Err(err) = state.pump_libinput() {
                    state.set_fatal(err);
                }
                Ok(PostAction::Continue)
            },
        )
        .map_err(|err| anyhow!("could not insert the libinput event source: {err}"))?;

    handle
        .insert_source(
            Generic::new(hotplug_fd, Interest::READ, Mode::Level),
            |_, fd, state: &mut State| -> io::Result<PostAction> {
                if let Err(err) = state.devices.handle_hotplug(fd.as_fd()) {
                    state.set_fatal(err);
                }
                Ok(PostAction::Continue)
            },
        )
        .map_err(|err| anyhow!("could not insert the hotplug event source: {err}"))?;

    info!("intercepting input events");

    loop {
        state.turn()?;
        if let Some(reason) = state.exit.take() {
            return Ok(reason);
        }

        let timeout = state.scheduler.timeout(state.clock.now());
        if let Err(err) = event_loop.dispatch(timeout, &mut state) {
            if is_disconnect(&err) {
                return Ok(ExitReason::CompositorGone);
            }
            return Err(anyhow::Error::new(err).context("event loop dispatch failed"));
        }
    }
}

/// Distinguishes "not authorized to create a virtual keyboard" from other
/// initial-roundtrip failures. The protocol reports it as a posted error
/// on the manager, which kills the connection.
fn virtual_keyboard_unauthorized(err: wayland_client::DispatchError) -> anyhow::Error {
    if let wayland_client::DispatchError::Backend(WaylandError::Protocol(ref proto)) = err {
        if proto.object_interface == "zwp_virtual_keyboard_manager_v1" {
            return anyhow!("not authorized to create a virtual keyboard");
        }
    }
    anyhow::Error::new(err).context("error completing the initial Wayland roundtrips")
}

/// Whether an event-loop error means the compositor went away, which is a
/// clean shutdown rather than a failure.
fn is_disconnect(err: &(dyn std::error::Error + 'static)) -> bool {
    let mut cur: Option<&(dyn std::error::Error + 'static)> = Some(err);
    while let Some(e) = cur {
        if let Some(io_err) = e.downcast_ref::<io::Error>() {
            if matches!(
                io_err.kind(),
                io::ErrorKind::BrokenPipe
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::UnexpectedEof
            ) {
                return true;
            }
        }
        if let Some(WaylandError::Io(io_err)) = e.downcast_ref::<WaylandError>() {
            if matches!(
                io_err.kind(),
                io::ErrorKind::BrokenPipe
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::UnexpectedEof
            ) {
                return true;
            }
        }
        cur = e.source();
    }
    false
}
