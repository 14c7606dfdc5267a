use crate::args::{parse_arguments, ArgLimits};
use crate::config::{ConfigError, ServerConfig};
use crate::error::{generate_error_response, GatewayError};
use crate::http::{Framing, Method, Request, Response};
use crate::launcher::Launcher;
use crate::relay::{Phase, Relay};
use crate::resolver::Resolver;
use log::{debug, info, warn};
use std::path::Path;
use std::time::Duration;

/// What the server should do with a parsed request.
pub enum Dispatch {
    Respond(Response),
    Stream(Relay),
}

/// Dispatches requests for one configured server block.
pub struct Router {
    resolver: Resolver,
    launcher: Launcher,
    limits: ArgLimits,
    timeout: Option<Duration>,
    max_body_size: usize,
}

impl Router {
    pub fn new(config: &ServerConfig) -> Result<Self, ConfigError> {
        let resolver = Resolver::new(
            &config.script_root,
            &config.extension,
            config.scripts.as_deref(),
            config.interpreter.is_none(),
        )
        .map_err(|source| ConfigError::ScriptRoot {
            path: config.script_root.clone(),
            source,
        })?;

        Ok(Router {
            resolver,
            launcher: Launcher::new(config.interpreter.clone(), config.stdin, config.stderr),
            limits: ArgLimits {
                max_args: config.max_args,
                max_arg_len: config.max_arg_len,
            },
            timeout: config.timeout(),
            max_body_size: config.client_max_body_size,
        })
    }

    pub fn script_root(&self) -> &Path {
        self.resolver.root()
    }

    pub fn max_body_size(&self) -> usize {
        self.max_body_size
    }

    pub fn reap_orphans(&self) -> usize {
        self.launcher.reap_orphans()
    }

    pub fn handle(&self, request: &Request) -> Dispatch {
        match self.dispatch(request) {
            Ok(relay) => Dispatch::Stream(relay),
            Err(err) => {
                warn!(
                    "{} {} -> {}: {}",
                    request.method.as_str(),
                    request.path,
                    err.status_code(),
                    err
                );
                Dispatch::Respond(generate_error_response(&err))
            }
        }
    }

    fn dispatch(&self, request: &Request) -> Result<Relay, GatewayError> {
        if request.method != Method::POST {
            return Err(GatewayError::MethodNotAllowed(request.method.as_str().to_string()));
        }

        debug!("{}: {:?}", request.path, Phase::Resolving);
        let target = self.resolver.resolve(&request.path)?;

        debug!("{}: {:?}", request.path, Phase::Checking);
        let target = self.resolver.check(target)?;
        let args = parse_arguments(&request.body, &self.limits)?;

        debug!("{}: {:?} with {:?}", request.path, Phase::Spawning, args);
        let process = self.launcher.spawn(&target, &args)?;
        info!(
            "request: {} with {} argument(s) as pid {}",
            target.path.display(),
            args.len(),
            process.id()
        );

        Ok(Relay::new(
            target,
            process,
            Framing::for_version(&request.version),
            self.timeout,
        ))
    }
}
