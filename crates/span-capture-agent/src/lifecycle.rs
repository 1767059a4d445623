// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Host lifecycle as an explicit state machine.
//!
//! The agent feeds every host notification and channel marker through
//! [`Lifecycle::on`] and carries out the returned [`Directive`]; the machine
//! itself performs no I/O.

use tokio::time::Instant;
use tracing::warn;

use crate::config::ProcessorMode;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LifecycleState {
    /// Not yet registered with the host.
    Registering,
    /// Between invocations, or inside one the agent does not hold.
    Idle,
    /// Holding the host until the current invocation's spans are out.
    Draining,
    /// Termination received; nothing but the final flush happens from here.
    ShuttingDown,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LifecycleEvent {
    Registered,
    Invoke { deadline: Instant },
    /// The exporter signalled that the invocation's spans are all written.
    InvocationComplete,
    /// The hold on an invocation ran out before its marker arrived.
    HoldExpired,
    Shutdown { deadline: Instant },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Directive {
    Nothing,
    /// Let the host continue right away.
    Release,
    /// Keep the host waiting until the marker arrives or `until` passes.
    Hold { until: Instant },
    /// Flush the open batch, then let the host continue.
    FlushAndRelease,
    /// Drain the channel, flush everything before `deadline` and exit.
    DrainAndExit { deadline: Instant },
}

#[derive(Debug)]
pub struct Lifecycle {
    state: LifecycleState,
    mode: ProcessorMode,
}

impl Lifecycle {
    pub fn new(mode: ProcessorMode) -> Self {
        Lifecycle {
            state: LifecycleState::Registering,
            mode,
        }
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn on(&mut self, event: LifecycleEvent) -> Directive {
        use LifecycleEvent as E;
        use LifecycleState as S;

        let (next, directive) = match (self.state, event) {
            (S::ShuttingDown, _) => (S::ShuttingDown, Directive::Nothing),
            (_, E::Shutdown { deadline }) => (S::ShuttingDown, Directive::DrainAndExit { deadline }),
            (S::Registering, E::Registered) => (S::Idle, Directive::Nothing),
            (S::Idle, E::Invoke { deadline }) => match self.mode {
                ProcessorMode::Sync => (S::Draining, Directive::Hold { until: deadline }),
                ProcessorMode::Async => (S::Idle, Directive::Release),
            },
            (S::Draining, E::InvocationComplete | E::HoldExpired) => {
                (S::Idle, Directive::FlushAndRelease)
            }
            // Markers outside a held invocation carry no information.
            (S::Idle, E::InvocationComplete | E::HoldExpired) => (S::Idle, Directive::Nothing),
            (state, event) => {
                warn!("ignoring lifecycle event {event:?} in state {state:?}");
                (state, Directive::Nothing)
            }
        };
        self.state = next;
        directive
    }
}
