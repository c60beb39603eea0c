//! Remote-callable declarations: a name, a positional-only signature, a
//! dispatch discipline, and the handler itself.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use futures::future::BoxFuture;

use tether_std::errors::{RemoteError, TetherError};

use crate::value::Value;

pub type SyncHandler = Arc<dyn Fn(Vec<Value>) -> Result<Value, RemoteError> + Send + Sync>;
pub type AsyncHandler =
    Arc<dyn Fn(Vec<Value>) -> BoxFuture<'static, Result<Value, RemoteError>> + Send + Sync>;
pub type CoerceHook = Arc<dyn Fn(Vec<Value>) -> Result<Vec<Value>, RemoteError> + Send + Sync>;

/// How the server executes a handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchMode {
    /// Run directly on the event loop.
    Inline,
    /// Await the handler's future on the event loop.
    Cooperative,
    /// Run on the shared blocking worker pool.
    Worker,
}

/// The handler disciplines are a closed sum; the execution strategy is
/// selected from the variant, never from inspecting the handler.
#[derive(Clone)]
pub enum Handler {
    Inline(SyncHandler),
    Cooperative(AsyncHandler),
    Worker(SyncHandler),
}

impl Handler {
    pub fn mode(&self) -> DispatchMode {
        match self {
            Handler::Inline(_) => DispatchMode::Inline,
            Handler::Cooperative(_) => DispatchMode::Cooperative,
            Handler::Worker(_) => DispatchMode::Worker,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
struct Param {
    name: String,
    default: Option<Value>,
}

/// An ordered positional-only parameter list. The dummy declare is the only
/// variadic signature; user declarations are rejected before they can be
/// registered with anything fancier than trailing defaults.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Signature {
    params: Vec<Param>,
    variadic: bool,
}

impl Signature {
    pub fn arity(&self) -> usize {
        self.params.len()
    }

    /// Bind positional arguments, filling trailing defaults.
    pub fn bind(&self, mut args: Vec<Value>) -> Result<Vec<Value>, RemoteError> {
        if self.variadic {
            return Ok(args);
        }
        if args.len() > self.params.len() {
            return Err(RemoteError::ContentVerifyFailed(format!(
                "expected at most {} arguments, got {}",
                self.params.len(),
                args.len()
            )));
        }
        for param in &self.params[args.len()..] {
            match &param.default {
                Some(default) => args.push(default.clone()),
                None => {
                    return Err(RemoteError::ContentVerifyFailed(format!(
                        "missing argument: {}",
                        param.name
                    )))
                }
            }
        }
        Ok(args)
    }
}

#[derive(Clone)]
pub struct Declare {
    name: String,
    signature: Signature,
    handler: Handler,
    coerce: Option<CoerceHook>,
}

impl Declare {
    pub fn builder(name: impl Into<String>) -> DeclareBuilder {
        DeclareBuilder {
            name: name.into(),
            params: Vec::new(),
            coerce: None,
        }
    }

    /// The stand-in for names the server does not know. Accepts any
    /// arguments and fails with the not-implemented kind.
    pub fn dummy(name: &str) -> Declare {
        let missing = name.to_string();
        Declare {
            name: name.to_string(),
            signature: Signature {
                params: Vec::new(),
                variadic: true,
            },
            handler: Handler::Inline(Arc::new(move |_args| {
                Err(RemoteError::FunctionNotImplemented(missing.clone()))
            })),
            coerce: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mode(&self) -> DispatchMode {
        self.handler.mode()
    }

    pub fn handler(&self) -> &Handler {
        &self.handler
    }

    pub fn signature(&self) -> &Signature {
        &self.signature
    }

    /// Bind arguments against the signature, then run the coercion hook.
    pub fn bind(&self, args: Vec<Value>) -> Result<Vec<Value>, RemoteError> {
        let bound = self.signature.bind(args)?;
        match &self.coerce {
            Some(hook) => hook(bound),
            None => Ok(bound),
        }
    }
}

impl fmt::Debug for Declare {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Declare")
            .field("name", &self.name)
            .field("mode", &self.mode())
            .field("arity", &self.signature.arity())
            .finish()
    }
}

impl fmt::Display for Declare {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<declare name='{}' mode={:?}>", self.name, self.mode())
    }
}

pub struct DeclareBuilder {
    name: String,
    params: Vec<Param>,
    coerce: Option<CoerceHook>,
}

impl DeclareBuilder {
    pub fn param(mut self, name: impl Into<String>) -> Self {
        self.params.push(Param {
            name: name.into(),
            default: None,
        });
        self
    }

    pub fn param_default(mut self, name: impl Into<String>, default: Value) -> Self {
        self.params.push(Param {
            name: name.into(),
            default: Some(default),
        });
        self
    }

    pub fn coerce(
        mut self,
        hook: impl Fn(Vec<Value>) -> Result<Vec<Value>, RemoteError> + Send + Sync + 'static,
    ) -> Self {
        self.coerce = Some(Arc::new(hook));
        self
    }

    pub fn inline(
        self,
        handler: impl Fn(Vec<Value>) -> Result<Value, RemoteError> + Send + Sync + 'static,
    ) -> Result<Declare, TetherError> {
        self.finish(Handler::Inline(Arc::new(handler)))
    }

    pub fn cooperative(
        self,
        handler: impl Fn(Vec<Value>) -> BoxFuture<'static, Result<Value, RemoteError>>
            + Send
            + Sync
            + 'static,
    ) -> Result<Declare, TetherError> {
        self.finish(Handler::Cooperative(Arc::new(handler)))
    }

    pub fn worker(
        self,
        handler: impl Fn(Vec<Value>) -> Result<Value, RemoteError> + Send + Sync + 'static,
    ) -> Result<Declare, TetherError> {
        self.finish(Handler::Worker(Arc::new(handler)))
    }

    fn finish(self, handler: Handler) -> Result<Declare, TetherError> {
        let mut seen_default = false;
        for (index, param) in self.params.iter().enumerate() {
            if self.params[..index].iter().any(|p| p.name == param.name) {
                return Err(TetherError::Declaration(format!(
                    "{}: duplicate parameter '{}'",
                    self.name, param.name
                )));
            }
            match (&param.default, seen_default) {
                (None, true) => {
                    return Err(TetherError::Declaration(format!(
                        "{}: required parameter '{}' follows a defaulted one",
                        self.name, param.name
                    )))
                }
                (Some(_), _) => seen_default = true,
                (None, false) => {}
            }
        }

        Ok(Declare {
            name: self.name,
            signature: Signature {
                params: self.params,
                variadic: false,
            },
            handler,
            coerce: self.coerce,
        })
    }
}

/// Name to declare table. Read-only once the server starts.
#[derive(Debug, Default)]
pub struct Registry {
    declares: HashMap<String, Declare>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Last write wins.
    pub fn register(&mut self, declare: Declare) {
        self.declares.insert(declare.name().to_string(), declare);
    }

    /// Resolve a name, falling back to a dummy for unknown methods.
    pub fn resolve(&self, name: &str) -> Declare {
        match self.declares.get(name) {
            Some(declare) => declare.clone(),
            None => Declare::dummy(name),
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.declares.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.declares.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.declares.len()
    }

    pub fn is_empty(&self) -> bool {
        self.declares.is_empty()
    }
}
