use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use harmony_bridge::engine::{register_engine_callbacks, EngineHandler, MenuPosition, ENGINE_READY};
use harmony_bridge::{Application, CallbackError, Params};
use harmony_core::{init_logging, AppDirs, Config};
use serde_json::Value;
use std::cell::Cell;
use std::rc::Rc;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Parser)]
#[command(name = "tk-harmony", version, about = "Talk to a running Harmony session")]
struct Cli {
    /// Host override (takes precedence over config and SGTK_HARMONY_ENGINE_HOST)
    #[arg(long, global = true)]
    host: Option<String>,
    /// Port override (takes precedence over config and SGTK_HARMONY_ENGINE_PORT)
    #[arg(long, global = true)]
    port: Option<u16>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// List the commands the application understands
    Dir,
    /// Send one command and print its result
    Call(CallCommand),
    /// Show the application version and whether it is supported
    Info,
    /// Serve engine events until the application quits
    Listen(ListenCommand),
}

#[derive(Debug, Parser, Clone)]
struct CallCommand {
    /// Remote method name, e.g. GET_FRAME_RANGE
    method: String,
    /// Named arguments as a JSON object
    #[arg(long)]
    params: Option<String>,
    /// Do not ask for a reply
    #[arg(long)]
    no_wait: bool,
    /// Reply timeout in milliseconds (defaults to bridge.read_timeout_ms)
    #[arg(long)]
    timeout_ms: Option<u64>,
}

#[derive(Debug, Parser, Clone)]
struct ListenCommand {
    /// Skip the ENGINE_READY broadcast
    #[arg(long)]
    no_ready: bool,
}

#[derive(Debug, Error)]
enum ParamsError {
    #[error("--params is not valid JSON: {0}")]
    Invalid(#[from] serde_json::Error),
    #[error("--params must be a JSON object, got {0}")]
    NotAnObject(&'static str),
}

impl CallCommand {
    fn params(&self) -> Result<Params, ParamsError> {
        let Some(raw) = self.params.as_deref() else {
            return Ok(Params::new());
        };
        match serde_json::from_str::<Value>(raw)? {
            Value::Object(params) => Ok(params),
            other => Err(ParamsError::NotAnObject(json_kind(&other))),
        }
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Logs peer events and stops the listen loop on quit.
#[derive(Default)]
struct ListenHandler {
    quit: Cell<bool>,
}

impl EngineHandler for ListenHandler {
    fn on_show_menu(
        &self,
        _app: &Application,
        position: Option<MenuPosition>,
    ) -> Result<(), CallbackError> {
        match position {
            Some(MenuPosition { x, y }) => println!("menu requested at ({x}, {y})"),
            None => println!("menu requested"),
        }
        Ok(())
    }

    fn on_new_project_created(
        &self,
        _app: &Application,
        path: Option<&str>,
    ) -> Result<(), CallbackError> {
        tracing::info!(path, "new project created");
        println!("new project: {}", path.unwrap_or("?"));
        Ok(())
    }

    fn on_project_opened(
        &self,
        app: &Application,
        path: Option<&str>,
    ) -> Result<(), CallbackError> {
        tracing::info!(path, "project opened");
        println!("opened: {}", path.unwrap_or("?"));
        if let Some(range) = app.frame_range() {
            println!("  frames {}-{}", range.start_frame, range.stop_frame);
        }
        Ok(())
    }

    fn on_quit(&self, _app: &Application) -> Result<(), CallbackError> {
        self.quit.set(true);
        Ok(())
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let dirs = AppDirs::discover()?;
    let config = Config::load_or_default(&dirs)?;
    let _logging = init_logging(&config.logging, &dirs)?;

    let endpoint = config.bridge.resolve_endpoint(cli.host.as_deref(), cli.port, |key| {
        std::env::var(key).ok()
    })?;
    tracing::info!(%endpoint, config_dir = %dirs.config_dir().display(), "connecting");

    let app = Rc::new(Application::tcp(&endpoint, &config));
    app.connect()?;

    match cli.command {
        Command::Dir => match app.list_commands() {
            Some(commands) => commands.iter().for_each(|command| println!("{command}")),
            None => bail!("no command list received from {endpoint}"),
        },
        Command::Call(call) => run_call(&app, &call)?,
        Command::Info => {
            let info = app.host_info();
            println!("{} {}", info.name, info.version);
            match app.check_compatibility() {
                Some(compatibility) => println!("compatibility: {compatibility}"),
                None => println!("compatibility: unknown"),
            }
            println!("project: {}", app.current_project_path());
        }
        Command::Listen(listen) => run_listen(&app, &listen)?,
    }

    Ok(())
}

fn run_call(app: &Application, call: &CallCommand) -> Result<()> {
    let params = call.params()?;
    let client = app.client();

    if call.no_wait {
        let id = client.notify(&call.method, params)?;
        tracing::debug!(%id, method = %call.method, "sent without waiting");
        return Ok(());
    }

    let timeout = call
        .timeout_ms
        .map(Duration::from_millis)
        .unwrap_or(client.options().read_timeout);
    match client.call_and_wait_timeout(&call.method, params, timeout)? {
        Some(result) => println!("{}", serde_json::to_string_pretty(&result)?),
        None => bail!("no reply to {} within {timeout:?}", call.method),
    }
    Ok(())
}

fn run_listen(app: &Rc<Application>, listen: &ListenCommand) -> Result<()> {
    let handler = Rc::new(ListenHandler::default());
    register_engine_callbacks(app, handler.clone());

    if !listen.no_ready {
        app.broadcast_event(ENGINE_READY);
    }
    tracing::info!("engine ready");

    let client = app.client();
    let interval = client.options().poll_interval;
    while !handler.quit.get() {
        client.poll(interval)?;
        if !client.is_connected() {
            bail!("connection closed by the application");
        }
    }
    tracing::info!("quitting");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn call(params: Option<&str>) -> CallCommand {
        CallCommand {
            method: "SET_FRAME_RANGE".into(),
            params: params.map(str::to_string),
            no_wait: false,
            timeout_ms: None,
        }
    }

    #[test]
    fn params_default_to_empty() {
        assert!(call(None).params().unwrap().is_empty());
    }

    #[test]
    fn params_parse_object() {
        let params = call(Some(r#"{"start_frame": 1, "stop_frame": 48}"#))
            .params()
            .expect("object params");
        assert_eq!(params["stop_frame"], json!(48));
    }

    #[test]
    fn params_reject_non_objects() {
        let err = call(Some("[1, 2]")).params().expect_err("array params");
        assert!(matches!(err, ParamsError::NotAnObject("an array")));

        let err = call(Some("{oops")).params().expect_err("bad json");
        assert!(matches!(err, ParamsError::Invalid(_)));
    }

    #[test]
    fn parses_call_with_global_overrides() {
        let cli = Cli::try_parse_from([
            "tk-harmony",
            "call",
            "GET_VERSION",
            "--timeout-ms",
            "250",
            "--port",
            "5151",
        ])
        .expect("valid command line");

        assert_eq!(cli.port, Some(5151));
        let Command::Call(call) = cli.command else {
            panic!("expected call subcommand");
        };
        assert_eq!(call.method, "GET_VERSION");
        assert_eq!(call.timeout_ms, Some(250));
        assert!(!call.no_wait);
    }

    #[test]
    fn listen_flags() {
        let cli = Cli::try_parse_from(["tk-harmony", "--host", "10.0.0.5", "listen", "--no-ready"])
            .expect("valid command line");
        assert_eq!(cli.host.as_deref(), Some("10.0.0.5"));
        assert!(matches!(cli.command, Command::Listen(ListenCommand { no_ready: true })));
    }

    #[test]
    fn subcommand_is_required() {
        assert!(Cli::try_parse_from(["tk-harmony"]).is_err());
    }
}
