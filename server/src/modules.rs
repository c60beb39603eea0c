//! Declare modules selectable with `--module`. Modules are compiled in;
//! the registry built here is what the worker serves.

use std::thread;
use std::time::Duration;

use futures::FutureExt;

use tether_protocol::{Declare, Registry, Value};

pub fn load(name: &str) -> Option<Registry> {
    match name {
        "hello-world" | "hello_world" => Some(hello_world()),
        _ => None,
    }
}

pub fn names() -> &'static [&'static str] {
    &["hello-world"]
}

/// The demo module: one declare per dispatch discipline.
pub fn hello_world() -> Registry {
    let mut registry = Registry::new();
    registry.register(hello_world_sync());
    registry.register(hello_world_async());
    registry.register(hello_world_thread());
    registry
}

pub fn hello_world_sync() -> Declare {
    Declare::builder("hello_world_sync")
        .param_default("sleep", Value::Int(0))
        .inline(|args| {
            if let Some(secs) = args[0].as_i64() {
                if secs > 0 {
                    thread::sleep(Duration::from_secs(secs as u64));
                }
            }
            Ok(Value::from("hello sync world!"))
        })
        .expect("hello_world_sync declaration")
}

pub fn hello_world_async() -> Declare {
    Declare::builder("hello_world_async")
        .param_default("sleep", Value::Int(0))
        .cooperative(|args| {
            let secs = args[0].as_i64().unwrap_or(0);
            async move {
                if secs > 0 {
                    tokio::time::sleep(Duration::from_secs(secs as u64)).await;
                }
                Ok(Value::from("hello async world!"))
            }
            .boxed()
        })
        .expect("hello_world_async declaration")
}

pub fn hello_world_thread() -> Declare {
    Declare::builder("hello_world_thread")
        .param_default("sleep", Value::Int(0))
        .worker(|args| {
            if let Some(secs) = args[0].as_i64() {
                if secs > 0 {
                    thread::sleep(Duration::from_secs(secs as u64));
                }
            }
            Ok(Value::from("hello thread world!"))
        })
        .expect("hello_world_thread declaration")
}
