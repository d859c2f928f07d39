//! Endpoint activation for switchyard: handler methods, endpoints, the
//! activator that feeds them from channels, and the aggregator, accumulator
//! and router strategies a method can delegate to.

pub mod activator;
pub mod endpoint;
pub mod handler;
pub mod strategy;

pub use {
    activator::{ActivationStyle, ActivatorBuilder, EndpointActivator, EndpointBinding, EndpointTarget},
    endpoint::{Endpoint, EndpointFactory, EndpointRegistry, InstanceResolver},
    handler::{HandlerFuture, HandlerMethod, Parameter},
    strategy::{
        Accumulator, AccumulatorConfig, Aggregator, MessageHandlingStrategy, RouteRule, Router,
        StrategyContext, StrategyKind, TimeWindow,
    },
};
