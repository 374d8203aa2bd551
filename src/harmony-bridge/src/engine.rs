//! Callbacks the peer application fires at the integration.

use crate::application::Application;
use crate::dispatcher::{CallbackError, CallbackResult};
use crate::protocol::Params;
use serde_json::Value;
use std::rc::{Rc, Weak};

/// Broadcast once the integration is ready to take commands.
pub const ENGINE_READY: &str = "ENGINE_READY";
/// Broadcast when the integration restarts itself.
pub const ENGINE_RESTART: &str = "ENGINE_RESTART";

pub const PING: &str = "PING";
pub const SHOW_MENU: &str = "SHOW_MENU";
pub const NEW_PROJECT_CREATED: &str = "NEW_PROJECT_CREATED";
pub const PROJECT_OPENED: &str = "PROJECT_OPENED";
pub const QUIT: &str = "QUIT";

/// Screen position where the user opened the menu.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MenuPosition {
    pub x: f64,
    pub y: f64,
}

impl MenuPosition {
    /// Read `clickedPosition: {x, y}` from the call arguments.
    pub fn from_params(params: &Params) -> Option<Self> {
        let clicked = params.get("clickedPosition")?.as_object()?;
        Some(Self {
            x: clicked.get("x")?.as_f64()?,
            y: clicked.get("y")?.as_f64()?,
        })
    }
}

/// Reactions to peer events. Every method has a default, so handlers only
/// implement what they care about.
pub trait EngineHandler {
    /// Liveness check. The return value is sent back when truthy.
    fn on_ping(&self, _app: &Application) -> Result<Value, CallbackError> {
        Ok(Value::Bool(true))
    }

    fn on_show_menu(
        &self,
        _app: &Application,
        _position: Option<MenuPosition>,
    ) -> Result<(), CallbackError> {
        Ok(())
    }

    fn on_new_project_created(
        &self,
        _app: &Application,
        _path: Option<&str>,
    ) -> Result<(), CallbackError> {
        Ok(())
    }

    fn on_project_opened(
        &self,
        _app: &Application,
        _path: Option<&str>,
    ) -> Result<(), CallbackError> {
        Ok(())
    }

    fn on_quit(&self, _app: &Application) -> Result<(), CallbackError> {
        Ok(())
    }
}

type EventReaction = fn(&dyn EngineHandler, &Application, &Params) -> CallbackResult;

/// Wire `handler` to the peer events on `app`'s client.
///
/// Callbacks hold the application weakly; once it is dropped they fail with
/// an error instead of keeping it alive.
pub fn register_engine_callbacks(app: &Rc<Application>, handler: Rc<dyn EngineHandler>) {
    let client = app.client();

    let on = |method: &'static str, react: EventReaction| {
        let app = Rc::downgrade(app);
        let handler = handler.clone();
        client.register_callback(method, move |_, params| {
            let app = upgrade(&app, method)?;
            react(handler.as_ref(), &app, params)
        });
    };

    on(PING, |handler, app, _| handler.on_ping(app).map(Some));
    on(SHOW_MENU, |handler, app, params| {
        let position = MenuPosition::from_params(params);
        tracing::debug!(?position, "show menu");
        handler.on_show_menu(app, position).map(|()| None)
    });
    on(NEW_PROJECT_CREATED, |handler, app, params| {
        handler
            .on_new_project_created(app, path_param(params))
            .map(|()| None)
    });
    on(PROJECT_OPENED, |handler, app, params| {
        handler
            .on_project_opened(app, path_param(params))
            .map(|()| None)
    });
    on(QUIT, |handler, app, _| {
        tracing::info!("quitting app");
        handler.on_quit(app).map(|()| None)
    });
}

fn upgrade(app: &Weak<Application>, method: &str) -> Result<Rc<Application>, CallbackError> {
    app.upgrade().ok_or_else(|| {
        tracing::warn!(method, "application dropped, ignoring event");
        CallbackError::new("application is shutting down")
    })
}

fn path_param(params: &Params) -> Option<&str> {
    params.get("path").and_then(Value::as_str)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::tests::{memory_client, Wire};
    use crate::protocol::{Call, Message};
    use crate::params;
    use harmony_core::Config;
    use serde_json::json;
    use std::cell::RefCell;
    use std::time::Duration;

    #[derive(Default)]
    struct Recorder {
        events: RefCell<Vec<String>>,
    }

    impl EngineHandler for Recorder {
        fn on_show_menu(
            &self,
            _app: &Application,
            position: Option<MenuPosition>,
        ) -> Result<(), CallbackError> {
            self.events.borrow_mut().push(format!("menu {position:?}"));
            Ok(())
        }

        fn on_project_opened(
            &self,
            _app: &Application,
            path: Option<&str>,
        ) -> Result<(), CallbackError> {
            self.events
                .borrow_mut()
                .push(format!("opened {}", path.unwrap_or("-")));
            Ok(())
        }

        fn on_quit(&self, _app: &Application) -> Result<(), CallbackError> {
            self.events.borrow_mut().push("quit".to_string());
            Ok(())
        }
    }

    fn deliver(wire: &Rc<RefCell<Wire>>, id: &str, method: &str, params: Params) {
        wire.borrow_mut().push(&Message::Call(Call {
            id: id.into(),
            method: method.into(),
            params,
            request_return: true,
        }));
    }

    fn setup() -> (Rc<Application>, Rc<Recorder>, Rc<RefCell<Wire>>) {
        let (client, wire) = memory_client();
        let app = Rc::new(Application::new(client, &Config::default()));
        let recorder = Rc::new(Recorder::default());
        register_engine_callbacks(&app, recorder.clone());
        (app, recorder, wire)
    }

    #[test]
    fn menu_position_parses_clicked_position() {
        let params = params! { "clickedPosition" => json!({"x": 120, "y": 45.5}) };
        assert_eq!(
            MenuPosition::from_params(&params),
            Some(MenuPosition { x: 120.0, y: 45.5 })
        );
        assert_eq!(MenuPosition::from_params(&Params::new()), None);
    }

    #[test]
    fn registers_every_event() {
        let (app, _, _) = setup();
        assert_eq!(
            app.client().registered_methods(),
            vec![NEW_PROJECT_CREATED, PING, PROJECT_OPENED, QUIT, SHOW_MENU]
        );
    }

    #[test]
    fn events_reach_handler() {
        let (app, recorder, wire) = setup();
        deliver(
            &wire,
            "1",
            SHOW_MENU,
            params! { "clickedPosition" => json!({"x": 10, "y": 20}) },
        );
        deliver(&wire, "2", PROJECT_OPENED, params! { "path" => "/shows/ep01.xstage" });
        deliver(&wire, "3", QUIT, Params::new());

        app.client().receive_available(Duration::ZERO).unwrap();
        assert_eq!(
            *recorder.events.borrow(),
            vec![
                "menu Some(MenuPosition { x: 10.0, y: 20.0 })",
                "opened /shows/ep01.xstage",
                "quit",
            ]
        );
        // none of these answer, even though a return was requested
        assert!(wire.borrow().outbound.is_empty());
    }

    #[test]
    fn ping_answers_true() {
        let (app, _, wire) = setup();
        deliver(&wire, "p", PING, Params::new());

        app.client().receive_available(Duration::ZERO).unwrap();
        assert_eq!(
            wire.borrow().outbound,
            vec![Message::reply("p".into(), json!(true))]
        );
    }
}
