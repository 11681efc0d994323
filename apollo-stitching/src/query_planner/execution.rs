use std::collections::HashMap;
use std::sync::Arc;

use futures::FutureExt;
use futures::StreamExt;
use futures::future;
use futures::future::BoxFuture;
use futures::TryFutureExt;
use futures::stream;
use parking_lot::Mutex;
use serde_json_bytes::ByteString;
use tokio_util::sync::CancellationToken;
use tokio_util::sync::DropGuard;
use tower::BoxError;
use tracing::Instrument;

use super::EXECUTION_SPAN_NAME;
use super::FETCH_SPAN_NAME;
use super::FieldPlan;
use super::QueryPlan;
use super::STITCH_SPAN_NAME;
use super::SUBSCRIPTION_EVENT_SPAN_NAME;
use super::SubPlan;
use super::TYPENAME_MARKER;
use crate::error::Error;
use crate::error::ExecutionError;
use crate::error::FetchError;
use crate::error::PlanningError;
use crate::error::QueryPlannerError;
use crate::graphql::IntoGraphQLErrors;
use crate::graphql::Request;
use crate::graphql::Response;
use crate::graphql::ResponseStream;
use crate::json_ext::Object;
use crate::json_ext::Path;
use crate::json_ext::PathElement;
use crate::json_ext::Value;
use crate::json_ext::ValueExt;
use crate::services::SubgraphRegistry;
use crate::services::SubgraphResponse;
use crate::services::SubscriptionResponse;
use crate::spec::OperationKind;
use crate::spec::Selection;
use crate::spec::operation::variables_used;
use crate::stitcher::ExecutionResult;
use crate::stitcher::SubscriptionResult;
use crate::stream::ConsolidatorHandle;
use crate::stream::StreamConsolidator;
use crate::stream::map_stream;
use crate::sync::CompletionGate;

/// What an execution needs besides the plan.
#[derive(Clone, Debug)]
pub(crate) struct ExecutionParameters {
    pub(crate) subgraphs: Arc<SubgraphRegistry>,
    pub(crate) variables: Object,
    /// Whether subsequent payloads of subgraphs using `@defer`/`@stream` are forwarded.
    pub(crate) incremental_delivery: bool,
}

impl QueryPlan {
    /// Executes a query or a mutation.
    ///
    /// Root fetches of a mutation run one after the other, in plan order. Everything else runs
    /// concurrently.
    pub(crate) async fn execute(
        self: &Arc<Self>,
        parameters: ExecutionParameters,
    ) -> Result<ExecutionResult, ExecutionError> {
        let execution = Execution::new(self.clone(), parameters);
        async {
            match self.kind {
                OperationKind::Mutation => {
                    for (subgraph, selections) in &self.root.plan {
                        let fetch = execution.state.root_fetch(subgraph, selections);
                        execution.state.clone().fetch(fetch).await?;
                    }
                }
                OperationKind::Query | OperationKind::Subscription => {
                    for (subgraph, selections) in &self.root.plan {
                        let fetch = execution.state.root_fetch(subgraph, selections);
                        execution.state.dispatch(fetch);
                    }
                }
            }
            execution.finish().await
        }
        .instrument(tracing::info_span!(
            EXECUTION_SPAN_NAME,
            "graphql.operation.kind" = self.kind.as_str(),
            "otel.kind" = "INTERNAL"
        ))
        .await
    }

    /// Starts a subscription on the subgraph fetching its root field, then stitches every event.
    pub(crate) async fn subscribe(
        self: &Arc<Self>,
        parameters: ExecutionParameters,
    ) -> Result<SubscriptionResult, ExecutionError> {
        let Some((name, selections)) = self.root.plan.first() else {
            return Ok(SubscriptionResult::Single(routing_error(
                "the subscription does not select any field".to_string(),
            )));
        };
        if self.root.plan.len() > 1 {
            tracing::debug!(
                subgraphs = self.root.plan.len(),
                "subscription spans several subgraphs, only '{name}' is subscribed to"
            );
        }

        let Some(subgraph) = parameters.subgraphs.get(name).cloned() else {
            return Ok(SubscriptionResult::Single(
                FetchError::UnknownSubgraph {
                    service: name.clone(),
                }
                .to_response(),
            ));
        };
        if !subgraph.supports_subscriptions() {
            return Ok(SubscriptionResult::Single(
                FetchError::SubscriptionNotSupported {
                    service: name.clone(),
                }
                .to_response(),
            ));
        }

        let request = subrequest(
            self,
            &parameters.variables,
            OperationKind::Subscription,
            selections,
        );
        let response = subgraph
            .subscribe(request)
            .instrument(tracing::info_span!(
                FETCH_SPAN_NAME,
                "subgraph.name" = name.as_str(),
                "graphql.path" = "/",
                "otel.kind" = "INTERNAL"
            ))
            .await;

        // subscriptions are never split
        let parameters = ExecutionParameters {
            incremental_delivery: false,
            ..parameters
        };
        match response {
            Err(err) => {
                let err = FetchError::SubrequestHttpError {
                    service: name.clone(),
                    reason: err.to_string(),
                };
                failfast_error!("subscription could not start: {}", err);
                Ok(SubscriptionResult::Single(err.to_response()))
            }
            Ok(SubscriptionResponse::Single(response)) => Ok(SubscriptionResult::Single(
                self.stitch_event(&parameters, response).await?,
            )),
            Ok(SubscriptionResponse::Stream(events)) => {
                let plan = self.clone();
                let events = map_stream(events, move |event| {
                    let plan = plan.clone();
                    let parameters = parameters.clone();
                    async move {
                        plan.stitch_event(&parameters, event)
                            .instrument(tracing::info_span!(
                                SUBSCRIPTION_EVENT_SPAN_NAME,
                                "otel.kind" = "INTERNAL"
                            ))
                            .await
                            .unwrap_or_else(|err| {
                                tracing::error!(error = %err, "subscription event could not be stitched");
                                Response::builder()
                                    .error(
                                        Error::builder()
                                            .message(err.to_string())
                                            .extension_code("SUBSCRIPTION_EVENT_FAILED")
                                            .build(),
                                    )
                                    .build()
                            })
                    }
                });
                Ok(SubscriptionResult::Stream(events.boxed()))
            }
        }
    }

    /// Runs the root follow-up fetches for one subscription event.
    async fn stitch_event(
        self: &Arc<Self>,
        parameters: &ExecutionParameters,
        event: Response,
    ) -> Result<Response, ExecutionError> {
        let execution = Execution::new(self.clone(), parameters.clone());
        let stitches = execution
            .state
            .merge(&Path::empty(), &PlanPointer::default(), event)?;
        for stitch in stitches {
            execution.state.dispatch(stitch);
        }
        Ok(match execution.finish().await? {
            ExecutionResult::Complete(response) => response,
            ExecutionResult::Incremental { initial, .. } => initial,
        })
    }
}

fn routing_error(reason: String) -> Response {
    let errors = QueryPlannerError::Routing { reason }
        .into_graphql_errors()
        .unwrap_or_default();
    Response::builder().errors(errors).build()
}

/// Builds the request sent to a subgraph, with the variables `selections` use.
fn subrequest(
    plan: &QueryPlan,
    variables: &Object,
    kind: OperationKind,
    selections: &[Selection],
) -> Request {
    let used: Object = variables_used(selections)
        .into_iter()
        .filter_map(|name| {
            let value = variables.get(name.as_str())?.clone();
            Some((ByteString::from(name), value))
        })
        .collect();
    Request::builder()
        .query(plan.operation.print_subrequest(kind, selections))
        .variables(used)
        .build()
}

/// Where a [`SubPlan`] sits in the plan: the response keys and concrete types leading to it.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
struct PlanPointer(Vec<(String, String)>);

impl PlanPointer {
    fn child(&self, key: &str, type_name: &str) -> Self {
        let mut segments = self.0.clone();
        segments.push((key.to_string(), type_name.to_string()));
        PlanPointer(segments)
    }
}

impl SubPlan {
    fn resolve(&self, pointer: &PlanPointer) -> Option<&SubPlan> {
        pointer.0.iter().try_fold(self, |sub_plan, (key, type_name)| {
            sub_plan.stitch_tree.get(key)?.by_type.get(type_name)
        })
    }
}

/// A pending subgraph call, and the response object its data goes into.
struct Fetch {
    subgraph: String,
    request: Request,
    path: Path,
    pointer: PlanPointer,
}

type IncrementalConsolidator =
    StreamConsolidator<Response, Response, fn(Response) -> Option<Response>>;

/// Keeps subsequent payloads carrying data or errors, all of them announce more payloads.
fn incremental_payload(response: Response) -> Option<Response> {
    (!response.is_empty_payload()).then_some(Response {
        has_next: Some(true),
        ..response
    })
}

/// One running execution.
///
/// Dropping it cancels every fetch it spawned.
struct Execution {
    state: Arc<ExecutionState>,
    consolidator: IncrementalConsolidator,
    _cancel_on_drop: DropGuard,
}

impl Execution {
    fn new(plan: Arc<QueryPlan>, parameters: ExecutionParameters) -> Self {
        Self::with_types(plan, parameters, ResolvedTypes::default())
    }

    fn with_types(
        plan: Arc<QueryPlan>,
        parameters: ExecutionParameters,
        types: ResolvedTypes,
    ) -> Self {
        let cancellation = CancellationToken::new();
        let (consolidator, incremental) = StreamConsolidator::new(
            Vec::new(),
            incremental_payload as fn(Response) -> Option<Response>,
        );
        Self {
            state: Arc::new(ExecutionState {
                plan,
                parameters,
                gate: CompletionGate::new(cancellation.clone()),
                response: Mutex::new(ResponseTree::default()),
                types,
                incremental,
            }),
            consolidator,
            _cancel_on_drop: cancellation.drop_guard(),
        }
    }

    async fn finish(self) -> Result<ExecutionResult, ExecutionError> {
        if !self.state.gate.is_empty() {
            self.state.gate.resolved().await?;
        }

        let (mut data, errors, incremental_sources) = {
            let mut tree = self.state.response.lock();
            (
                std::mem::take(&mut tree.data),
                std::mem::take(&mut tree.errors),
                tree.incremental_sources,
            )
        };
        data.strip_key_recursively(TYPENAME_MARKER);
        let response = Response::builder().data(data).errors(errors).build();

        self.state.incremental.close();
        if incremental_sources == 0 {
            return Ok(ExecutionResult::Complete(response));
        }

        tracing::info!(
            monotonic_counter.apollo.stitching.operations.incremental = 1u64,
            sources = incremental_sources,
            "execution delivers incremental payloads"
        );
        let subsequent: ResponseStream = self
            .consolidator
            .map(|payload| match payload {
                Ok(response) => response,
                Err(err) => Response::builder()
                    .error(
                        Error::builder()
                            .message(err.to_string())
                            .extension_code("INCREMENTAL_DELIVERY_FAILED")
                            .build(),
                    )
                    .has_next(true)
                    .build(),
            })
            .chain(stream::once(future::ready(
                Response::builder().has_next(false).build(),
            )))
            .boxed();
        Ok(ExecutionResult::Incremental {
            initial: Response {
                has_next: Some(true),
                ..response
            },
            subsequent,
        })
    }
}

#[derive(Debug)]
struct ResponseTree {
    data: Value,
    errors: Vec<Error>,
    incremental_sources: usize,
}

impl Default for ResponseTree {
    fn default() -> Self {
        Self {
            data: Value::Object(Object::new()),
            errors: Vec::new(),
            incremental_sources: 0,
        }
    }
}

/// Concrete types of the objects found at abstract positions, by response path.
type ResolvedTypes = Arc<Mutex<HashMap<Path, String>>>;

struct ExecutionState {
    plan: Arc<QueryPlan>,
    parameters: ExecutionParameters,
    gate: CompletionGate,
    response: Mutex<ResponseTree>,
    types: ResolvedTypes,
    incremental: ConsolidatorHandle<Response>,
}

impl ExecutionState {
    fn root_fetch(&self, subgraph: &str, selections: &[Selection]) -> Fetch {
        Fetch {
            subgraph: subgraph.to_string(),
            request: subrequest(
                &self.plan,
                &self.parameters.variables,
                self.plan.kind,
                selections,
            ),
            path: Path::empty(),
            pointer: PlanPointer::default(),
        }
    }

    fn dispatch(self: &Arc<Self>, fetch: Fetch) {
        self.gate.add(self.clone().fetch(fetch));
    }

    /// Calls a subgraph, merges its answer and dispatches the follow-up fetches it enables.
    fn fetch(self: Arc<Self>, fetch: Fetch) -> BoxFuture<'static, Result<(), ExecutionError>> {
        let span = tracing::info_span!(
            FETCH_SPAN_NAME,
            "subgraph.name" = fetch.subgraph.as_str(),
            "graphql.path" = %fetch.path,
            "otel.kind" = "INTERNAL"
        );
        async move {
            let Fetch {
                subgraph: name,
                request,
                path,
                pointer,
            } = fetch;

            let result = match self.parameters.subgraphs.get(&name).cloned() {
                None => Err(FetchError::UnknownSubgraph {
                    service: name.clone(),
                }),
                Some(subgraph) => {
                    tracing::trace!(query = ?request.query, "sending subrequest");
                    subgraph.execute(request).await.map_err(|err| {
                        FetchError::SubrequestHttpError {
                            service: name.clone(),
                            reason: err.to_string(),
                        }
                    })
                }
            };
            let response = match result {
                Ok(SubgraphResponse::Complete(response)) => response,
                Ok(SubgraphResponse::Incremental {
                    initial,
                    subsequent,
                }) => {
                    self.add_incremental(&path, &pointer, subsequent);
                    initial
                }
                Err(err) => {
                    failfast_error!("fetch from '{}' failed: {}", name, err);
                    Response::builder()
                        .data(Value::Null)
                        .error(err.to_graphql_error(None))
                        .build()
                }
            };

            let stitches = self.merge_from(&name, &path, &pointer, response)?;
            for stitch in stitches {
                self.dispatch(stitch);
            }
            Ok(())
        }
        .instrument(span)
        .boxed()
    }

    fn merge_from(
        &self,
        name: &str,
        path: &Path,
        pointer: &PlanPointer,
        mut response: Response,
    ) -> Result<Vec<Fetch>, ExecutionError> {
        if let Some(data) = &response.data
            && !data.is_object()
            && !data.is_null()
        {
            failfast_debug!("invalid type for data in response from '{}'", name);
            response.data = Some(Value::Null);
            response.errors.push(
                FetchError::SubrequestMalformedResponse {
                    service: name.to_string(),
                    reason: "data is neither an object nor null".to_string(),
                }
                .to_graphql_error(None),
            );
        }
        self.merge(path, pointer, response)
    }

    /// Merges a subgraph answer at `path`, returning the follow-up fetches it enables.
    ///
    /// The answer is discarded when the target is gone or null. A null answer nulls the target
    /// only, null values are not propagated to its ancestors.
    fn merge(
        &self,
        path: &Path,
        pointer: &PlanPointer,
        response: Response,
    ) -> Result<Vec<Fetch>, ExecutionError> {
        let _span = tracing::debug_span!(STITCH_SPAN_NAME, "graphql.path" = %path).entered();
        let sub_plan = self
            .plan
            .root
            .resolve(pointer)
            .ok_or_else(|| PlanningError::MissingFieldPlan { path: path.clone() })?;

        let mut tree = self.response.lock();
        let tree = &mut *tree;
        let Some(target) = tree.data.get_path_mut(path) else {
            tracing::debug!("stitch target is gone, discarding the response");
            return Ok(Vec::new());
        };
        if target.is_null() {
            tracing::debug!("stitch target is null, discarding the response");
            return Ok(Vec::new());
        }
        tree.errors.extend(
            response
                .errors
                .into_iter()
                .map(|error| error.with_path_prefix(path)),
        );

        let incoming = match response.data {
            Some(Value::Object(incoming)) => incoming,
            _ => {
                *target = Value::Null;
                return Ok(Vec::new());
            }
        };

        let keys: Vec<String> = incoming
            .keys()
            .map(|key| key.as_str().to_string())
            .collect();
        target.deep_merge(Value::Object(incoming));

        let mut fetches = Vec::new();
        if let Value::Object(object) = target {
            self.stitch_object(
                object,
                path,
                pointer,
                sub_plan,
                Some(keys.as_slice()),
                &mut fetches,
            )?;
        }
        Ok(fetches)
    }

    fn stitch_object(
        &self,
        object: &mut Object,
        path: &Path,
        pointer: &PlanPointer,
        sub_plan: &SubPlan,
        keys: Option<&[String]>,
        fetches: &mut Vec<Fetch>,
    ) -> Result<(), PlanningError> {
        for (key, field_plan) in &sub_plan.stitch_tree {
            if keys.is_some_and(|keys| !keys.contains(key)) {
                continue;
            }
            if let Some(value) = object.get_mut(key.as_str()) {
                let path = path.with_key(key);
                self.stitch_value(value, &path, pointer, key, field_plan, fetches)?;
            }
        }
        Ok(())
    }

    fn stitch_value(
        &self,
        value: &mut Value,
        path: &Path,
        pointer: &PlanPointer,
        key: &str,
        field_plan: &FieldPlan,
        fetches: &mut Vec<Fetch>,
    ) -> Result<(), PlanningError> {
        match value {
            Value::Array(items) => {
                for (index, item) in items.iter_mut().enumerate() {
                    let path = path.with_index(index);
                    self.stitch_value(item, &path, pointer, key, field_plan, fetches)?;
                }
                Ok(())
            }
            Value::Object(object) => {
                let type_name = match object.remove(TYPENAME_MARKER) {
                    Some(Value::String(type_name)) => type_name.as_str().to_string(),
                    _ => self.known_type(path, field_plan).ok_or_else(|| {
                        PlanningError::MissingTypeMarker {
                            path: path.clone(),
                            candidates: field_plan.by_type.len(),
                        }
                    })?,
                };
                if field_plan.is_abstract {
                    self.types.lock().insert(path.clone(), type_name.clone());
                }
                let Some(type_plan) = field_plan.by_type.get(&type_name) else {
                    return Ok(());
                };

                let pointer = pointer.child(key, &type_name);
                for (subgraph, selections) in &type_plan.plan {
                    fetches.push(Fetch {
                        subgraph: subgraph.clone(),
                        request: subrequest(
                            &self.plan,
                            &self.parameters.variables,
                            OperationKind::Query,
                            selections,
                        ),
                        path: path.clone(),
                        pointer: pointer.clone(),
                    });
                }
                // data already fetched with the object may hold further stitch points
                self.stitch_object(object, path, &pointer, type_plan, None, fetches)
            }
            _ => Ok(()),
        }
    }

    /// The type of the object at `path` when its response carries no marker.
    ///
    /// Concrete positions have a single candidate. At abstract positions only a type recorded
    /// when the object was first stitched can be trusted.
    fn known_type(&self, path: &Path, field_plan: &FieldPlan) -> Option<String> {
        if field_plan.is_abstract {
            self.types.lock().get(path).cloned()
        } else {
            field_plan.by_type.keys().next().cloned()
        }
    }

    /// Follows `relative` from the object at `path`, returning the plan position it reaches.
    ///
    /// `None` when no follow-up fetch can be needed at or below that position.
    fn locate<'p>(
        &'p self,
        path: &Path,
        pointer: &PlanPointer,
        relative: &Path,
    ) -> Result<Option<Position<'p>>, PlanningError> {
        let sub_plan = self
            .plan
            .root
            .resolve(pointer)
            .ok_or_else(|| PlanningError::MissingFieldPlan { path: path.clone() })?;

        let mut path = path.clone();
        let mut position = Position::Object {
            pointer: pointer.clone(),
            sub_plan,
        };
        for element in relative.iter() {
            position = match (position, element) {
                (position @ Position::Field { .. }, PathElement::Index(index)) => {
                    path = path.with_index(*index);
                    position
                }
                (Position::Object { .. }, PathElement::Index(_)) => return Ok(None),
                (position, PathElement::Key(key)) => {
                    let (pointer, sub_plan) = match position {
                        Position::Object { pointer, sub_plan } => (pointer, sub_plan),
                        Position::Field {
                            pointer,
                            key: parent,
                            field_plan,
                        } => {
                            let Some(type_name) = self.known_type(&path, field_plan) else {
                                tracing::debug!(path = %path, "type of the object is unknown");
                                return Ok(None);
                            };
                            let Some(sub_plan) = field_plan.by_type.get(&type_name) else {
                                return Ok(None);
                            };
                            (pointer.child(&parent, &type_name), sub_plan)
                        }
                    };
                    let Some(field_plan) = sub_plan.stitch_tree.get(key) else {
                        return Ok(None);
                    };
                    path = path.with_key(key);
                    Position::Field {
                        pointer,
                        key: key.clone(),
                        field_plan,
                    }
                }
            };
        }
        Ok(Some(position))
    }

    fn add_incremental(&self, path: &Path, pointer: &PlanPointer, subsequent: ResponseStream) {
        if !self.parameters.incremental_delivery {
            tracing::debug!("incremental delivery is disabled, ignoring subsequent payloads");
            return;
        }
        let source = IncrementalSource {
            plan: self.plan.clone(),
            // payloads of the follow-up fetches are not forwarded
            parameters: ExecutionParameters {
                incremental_delivery: false,
                ..self.parameters.clone()
            },
            types: self.types.clone(),
            path: path.clone(),
            pointer: pointer.clone(),
        };
        let payloads = map_stream(subsequent, move |payload| {
            source.clone().stitch(payload).map_err(BoxError::from)
        });
        if self.incremental.add(payloads.boxed()) {
            self.response.lock().incremental_sources += 1;
        }
    }
}

/// A position in the plan reached from a subsequent payload's path.
enum Position<'p> {
    /// An object whose concrete type is known.
    Object {
        pointer: PlanPointer,
        sub_plan: &'p SubPlan,
    },
    /// The value of `key`, in the object `pointer` designates.
    Field {
        pointer: PlanPointer,
        key: String,
        field_plan: &'p FieldPlan,
    },
}

/// The subsequent payloads of one subgraph response, and where that response was merged.
#[derive(Clone)]
struct IncrementalSource {
    plan: Arc<QueryPlan>,
    parameters: ExecutionParameters,
    types: ResolvedTypes,
    path: Path,
    pointer: PlanPointer,
}

impl IncrementalSource {
    /// Relocates a subsequent payload and runs the follow-up fetches its data enables.
    ///
    /// The payload is delivered once every follow-up fetch has been merged into it.
    async fn stitch(self, payload: Response) -> Result<Response, ExecutionError> {
        let mut payload = relocate(payload, &self.path);
        if let Some(data) = payload.data.as_mut() {
            if let Some(path) = &payload.path {
                let errors = self.stitch_data(path, data).await?;
                payload.errors.extend(errors);
            }
            data.strip_key_recursively(TYPENAME_MARKER);
        }
        for incremental in payload.incremental.iter_mut() {
            if let (Some(path), Some(data)) = (&incremental.path, incremental.data.as_mut()) {
                let errors = self.stitch_data(path, data).await?;
                incremental.errors.extend(errors);
                data.strip_key_recursively(TYPENAME_MARKER);
            }
        }
        Ok(payload)
    }

    /// Stitches `data`, found at `path` in the response, returning the errors of its follow-ups.
    async fn stitch_data(
        &self,
        path: &Path,
        data: &mut Value,
    ) -> Result<Vec<Error>, ExecutionError> {
        let relative = Path(path.0.get(self.path.len()..).unwrap_or_default().to_vec());
        let execution = Execution::with_types(
            self.plan.clone(),
            self.parameters.clone(),
            self.types.clone(),
        );
        let state = &execution.state;

        let fetches = {
            let Some(position) = state.locate(&self.path, &self.pointer, &relative)? else {
                return Ok(Vec::new());
            };
            let mut fetches = Vec::new();
            let mut tree = state.response.lock();
            tree.data = nest(path, std::mem::take(data));
            if let Some(target) = tree.data.get_path_mut(path) {
                match position {
                    Position::Field {
                        pointer,
                        key,
                        field_plan,
                    } => {
                        state.stitch_value(target, path, &pointer, &key, field_plan, &mut fetches)?
                    }
                    Position::Object { pointer, sub_plan } => {
                        if let Value::Object(object) = target {
                            state.stitch_object(
                                object,
                                path,
                                &pointer,
                                sub_plan,
                                None,
                                &mut fetches,
                            )?;
                        }
                    }
                }
            }
            fetches
        };
        if !fetches.is_empty() {
            tracing::debug!(path = %path, fetches = fetches.len(), "stitching a subsequent payload");
            for fetch in fetches {
                state.dispatch(fetch);
            }
            state.gate.resolved().await?;
        }

        let mut tree = state.response.lock();
        *data = tree.data.get_path_mut(path).map(std::mem::take).unwrap_or_default();
        Ok(std::mem::take(&mut tree.errors))
    }
}

/// Places `value` at `path` in an otherwise empty document.
fn nest(path: &Path, value: Value) -> Value {
    path.iter().rev().fold(value, |value, element| match element {
        PathElement::Key(key) => {
            let mut object = Object::new();
            object.insert(ByteString::from(key.as_str()), value);
            Value::Object(object)
        }
        PathElement::Index(index) => {
            let mut items = vec![Value::Null; *index];
            items.push(value);
            Value::Array(items)
        }
    })
}

/// Moves a subsequent payload of a subgraph to where that subgraph's data sits in the response.
fn relocate(mut payload: Response, prefix: &Path) -> Response {
    payload.path = payload.path.map(|path| prefix.join(path));
    payload.errors = payload
        .errors
        .into_iter()
        .map(|error| error.with_path_prefix(prefix))
        .collect();
    for incremental in payload.incremental.iter_mut() {
        incremental.path = Some(match incremental.path.take() {
            Some(path) => prefix.join(path),
            None => prefix.clone(),
        });
        incremental.errors = std::mem::take(&mut incremental.errors)
            .into_iter()
            .map(|error| error.with_path_prefix(prefix))
            .collect();
    }
    payload
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use mockall::mock;
    use mockall::predicate;
    use pretty_assertions::assert_eq;
    use serde_json_bytes::json;
    use test_log::test;
    use tower::BoxError;

    use super::*;
    use crate::graphql::IncrementalResponse;
    use crate::query_planner::QueryPlanner;
    use crate::services::Subgraph;
    use crate::spec::Operation;
    use crate::spec::Supergraph;
    use crate::spec::UnifiedSchema;
    use crate::test_harness::MockSubgraph;

    mock! {
        Service {}

        #[async_trait]
        impl Subgraph for Service {
            async fn execute(&self, request: Request) -> Result<SubgraphResponse, BoxError>;
        }
    }

    const ACCOUNTS: &str = r#"
        type Query { me: User node(id: ID!): Node }
        type Mutation { login(name: String!): User }
        interface Node { id: ID! }
        type User implements Node { id: ID! name: String }
    "#;

    const REVIEWS: &str = r#"
        type Query { topReviews: [Review] }
        type Mutation { review(body: String!): Review }
        type User { id: ID! reviews: [Review] }
        type Review { id: ID! body: String author: User }
    "#;

    fn plan(query: &str) -> Arc<QueryPlan> {
        let schema: Arc<dyn UnifiedSchema> = Arc::new(
            Supergraph::builder()
                .subgraph("accounts", ACCOUNTS)
                .subgraph("reviews", REVIEWS)
                .build()
                .unwrap(),
        );
        let operation = Operation::from_document(query, None).unwrap();
        Arc::new(
            QueryPlanner::new(schema)
                .plan(Arc::new(operation))
                .unwrap(),
        )
    }

    fn parameters(subgraphs: SubgraphRegistry) -> ExecutionParameters {
        ExecutionParameters {
            subgraphs: Arc::new(subgraphs),
            variables: Object::new(),
            incremental_delivery: true,
        }
    }

    async fn complete(plan: &Arc<QueryPlan>, parameters: ExecutionParameters) -> Response {
        match plan.execute(parameters).await.unwrap() {
            ExecutionResult::Complete(response) => response,
            ExecutionResult::Incremental { .. } => panic!("expected a complete response"),
        }
    }

    #[test(tokio::test)]
    async fn test_stitches_nested_fields_in_lists() {
        let plan = plan("{ me { name reviews { body } } }");
        let accounts = MockSubgraph::builder()
            .response(
                "query { me { name } }",
                json!({ "data": { "me": { "name": "Ada" } } }),
            )
            .build();
        let reviews = MockSubgraph::builder()
            .response(
                "query { reviews { body } }",
                json!({ "data": { "reviews": [{ "body": "great" }, { "body": "meh" }] } }),
            )
            .build();

        let response = complete(
            &plan,
            parameters(
                SubgraphRegistry::new()
                    .with("accounts", Arc::new(accounts))
                    .with("reviews", Arc::new(reviews)),
            ),
        )
        .await;
        assert_eq!(
            serde_json_bytes::to_value(&response).unwrap(),
            json!({
                "data": {
                    "me": { "name": "Ada", "reviews": [{ "body": "great" }, { "body": "meh" }] }
                }
            })
        );
    }

    #[tokio::test]
    async fn test_markers_are_stripped_and_resolve_the_type() {
        let plan = plan(r#"{ node(id: "1") { id ... on User { reviews { body } } } }"#);
        let accounts = MockSubgraph::builder()
            .response(
                r#"query { node(id: "1") { __stitching__typename: __typename ... on User { id } } }"#,
                json!({ "data": { "node": { "__stitching__typename": "User", "id": "1" } } }),
            )
            .build();
        let reviews = MockSubgraph::builder()
            .response(
                "query { reviews { body } }",
                json!({ "data": { "reviews": [{ "body": "great" }] } }),
            )
            .build();

        let response = complete(
            &plan,
            parameters(
                SubgraphRegistry::new()
                    .with("accounts", Arc::new(accounts))
                    .with("reviews", Arc::new(reviews)),
            ),
        )
        .await;
        assert_eq!(
            response.data,
            Some(json!({ "node": { "id": "1", "reviews": [{ "body": "great" }] } }))
        );
        assert!(response.errors.is_empty());
    }

    #[tokio::test]
    async fn test_placeholder_selections_do_not_reach_the_client() {
        let plan = plan("{ me { reviews { body } } }");
        let accounts = MockSubgraph::builder()
            .response(
                "query { me { __stitching__typename: __typename } }",
                json!({ "data": { "me": { "__stitching__typename": "User" } } }),
            )
            .build();
        let reviews = MockSubgraph::builder()
            .response(
                "query { reviews { body } }",
                json!({ "data": { "reviews": [{ "body": "great" }] } }),
            )
            .build();

        let response = complete(
            &plan,
            parameters(
                SubgraphRegistry::new()
                    .with("accounts", Arc::new(accounts))
                    .with("reviews", Arc::new(reviews)),
            ),
        )
        .await;
        assert_eq!(
            serde_json_bytes::to_value(&response).unwrap(),
            json!({ "data": { "me": { "reviews": [{ "body": "great" }] } } })
        );
    }

    #[test(tokio::test)]
    async fn test_stitches_below_stitched_lists() {
        let plan = plan("{ me { reviews { body author { name } } } }");
        let accounts = MockSubgraph::builder()
            .response(
                "query { me { __stitching__typename: __typename } }",
                json!({ "data": { "me": { "__stitching__typename": "User" } } }),
            )
            .response("query { name }", json!({ "data": { "name": "Ada" } }))
            .build();
        let reviews = MockSubgraph::builder()
            .response(
                "query { reviews { body author { __stitching__typename: __typename } } }",
                json!({ "data": { "reviews": [
                    { "body": "great", "author": { "__stitching__typename": "User" } },
                    { "body": "meh", "author": { "__stitching__typename": "User" } }
                ] } }),
            )
            .build();
        let accounts = Arc::new(accounts);

        let response = complete(
            &plan,
            parameters(
                SubgraphRegistry::new()
                    .with("accounts", accounts.clone())
                    .with("reviews", Arc::new(reviews)),
            ),
        )
        .await;
        insta::assert_json_snapshot!(response, @r###"
        {
          "data": {
            "me": {
              "reviews": [
                {
                  "body": "great",
                  "author": {
                    "name": "Ada"
                  }
                },
                {
                  "body": "meh",
                  "author": {
                    "name": "Ada"
                  }
                }
              ]
            }
          }
        }
        "###);
        // one call for `me`, one per author
        assert_eq!(accounts.requests().len(), 3);
    }

    #[tokio::test]
    async fn test_missing_marker_at_abstract_position_is_fatal_with_one_candidate() {
        let plan = plan(r#"{ node(id: "1") { id ... on User { reviews { body } } } }"#);
        assert_eq!(plan.root.stitch_tree["node"].by_type.len(), 1);
        let accounts = MockSubgraph::builder()
            .response(
                r#"query { node(id: "1") { __stitching__typename: __typename ... on User { id } } }"#,
                json!({ "data": { "node": { "id": "1" } } }),
            )
            .build();

        let error = plan
            .execute(parameters(
                SubgraphRegistry::new()
                    .with("accounts", Arc::new(accounts))
                    .with("reviews", Arc::new(MockSubgraph::builder().build())),
            ))
            .await
            .unwrap_err();
        assert_eq!(
            error,
            ExecutionError::Planning(PlanningError::MissingTypeMarker {
                path: Path::from("node"),
                candidates: 1,
            })
        );
    }

    #[tokio::test]
    async fn test_answers_for_a_null_target_are_discarded_with_their_errors() {
        let plan = plan("{ me { name reviews { body } } }");
        let execution = Execution::new(plan, parameters(SubgraphRegistry::new()));
        execution.state.response.lock().data = json!({ "me": { "name": "Ada" } });
        let pointer = PlanPointer::default().child("me", "User");

        let rejected = Response::builder()
            .data(Value::Null)
            .error(Error::builder().message("reviews are down").build())
            .build();
        let late = Response::builder()
            .data(json!({ "reviews": [] }))
            .error(Error::builder().message("reviews are slow").build())
            .build();
        let lost = Response::builder()
            .data(json!({ "reviews": [] }))
            .error(Error::builder().message("nobody is there").build())
            .build();
        assert!(
            execution
                .state
                .merge(&Path::from("me"), &pointer, rejected)
                .unwrap()
                .is_empty()
        );
        assert!(
            execution
                .state
                .merge(&Path::from("me"), &pointer, late)
                .unwrap()
                .is_empty()
        );
        assert!(
            execution
                .state
                .merge(&Path::from("you"), &pointer, lost)
                .unwrap()
                .is_empty()
        );

        let tree = execution.state.response.lock();
        assert_eq!(tree.data, json!({ "me": null }));
        assert_eq!(
            tree.errors
                .iter()
                .map(|error| error.message.as_str())
                .collect::<Vec<_>>(),
            vec!["reviews are down"]
        );
    }

    #[tokio::test]
    async fn test_missing_marker_is_fatal() {
        let plan = plan(r#"{ node(id: "1") { id ... on User { reviews { body } } } }"#);
        // two candidate types at the same position, the marker is the only way to tell them apart
        let plan = {
            let mut plan = (*plan).clone();
            let field_plan = plan.root.stitch_tree.get_mut("node").unwrap();
            let user = field_plan.by_type["User"].clone();
            field_plan.by_type.insert("Review".to_string(), user);
            Arc::new(plan)
        };
        let accounts = MockSubgraph::builder()
            .response(
                r#"query { node(id: "1") { __stitching__typename: __typename ... on User { id } } }"#,
                json!({ "data": { "node": { "id": "1" } } }),
            )
            .build();

        let error = plan
            .execute(parameters(
                SubgraphRegistry::new()
                    .with("accounts", Arc::new(accounts))
                    .with("reviews", Arc::new(MockSubgraph::builder().build())),
            ))
            .await
            .unwrap_err();
        assert_eq!(
            error,
            ExecutionError::Planning(PlanningError::MissingTypeMarker {
                path: Path::from("node"),
                candidates: 2,
            })
        );
    }

    #[tokio::test]
    async fn test_null_stitch_result_only_nulls_its_target() {
        let plan = plan("{ me { name reviews { body } } topReviews { body } }");
        let accounts = MockSubgraph::builder()
            .response(
                "query { me { name } }",
                json!({ "data": { "me": { "name": "Ada" } } }),
            )
            .build();
        let reviews = MockSubgraph::builder()
            .response(
                "query { reviews { body } }",
                json!({ "data": null, "errors": [{ "message": "reviews are down", "path": ["reviews"] }] }),
            )
            .response(
                "query { topReviews { body } }",
                json!({ "data": { "topReviews": [{ "body": "top" }] } }),
            )
            .build();

        let response = complete(
            &plan,
            parameters(
                SubgraphRegistry::new()
                    .with("accounts", Arc::new(accounts))
                    .with("reviews", Arc::new(reviews)),
            ),
        )
        .await;
        assert_eq!(
            serde_json_bytes::to_value(&response).unwrap(),
            json!({
                "data": { "me": null, "topReviews": [{ "body": "top" }] },
                "errors": [{ "message": "reviews are down", "path": ["me", "reviews"] }]
            })
        );
    }

    #[tokio::test]
    async fn test_rejected_stitch_is_reported_at_its_target() {
        let plan = plan("{ me { name reviews { body } } }");
        let accounts = MockSubgraph::builder()
            .response(
                "query { me { name } }",
                json!({ "data": { "me": { "name": "Ada" } } }),
            )
            .build();
        let mut reviews = MockService::new();
        reviews
            .expect_execute()
            .times(1)
            .returning(|_| Err("connection refused".into()));

        let response = complete(
            &plan,
            parameters(
                SubgraphRegistry::new()
                    .with("accounts", Arc::new(accounts))
                    .with("reviews", Arc::new(reviews)),
            ),
        )
        .await;
        insta::assert_json_snapshot!(response, @r###"
        {
          "data": {
            "me": null
          },
          "errors": [
            {
              "message": "HTTP fetch failed from 'reviews': connection refused",
              "path": [
                "me"
              ],
              "extensions": {
                "service": "reviews",
                "code": "SUBREQUEST_HTTP_ERROR"
              }
            }
          ]
        }
        "###);
    }

    #[tokio::test(start_paused = true)]
    async fn test_mutation_root_fetches_are_serial() {
        let plan = plan(
            r#"mutation { login(name: "ada") { name } review(body: "nice") { body } }"#,
        );
        let accounts = MockSubgraph::builder()
            .response(
                r#"mutation { login(name: "ada") { name } }"#,
                json!({ "data": { "login": { "name": "Ada" } } }),
            )
            .delay(Duration::from_millis(100))
            .build();
        let mut reviews = MockService::new();
        let started = tokio::time::Instant::now();
        reviews
            .expect_execute()
            .with(predicate::function(|request: &Request| {
                request.query.as_deref() == Some(r#"mutation { review(body: "nice") { body } }"#)
            }))
            .times(1)
            .returning(move |_| {
                // the first mutation has answered
                assert!(started.elapsed() >= Duration::from_millis(100));
                Ok(Response::builder()
                    .data(json!({ "review": { "body": "nice" } }))
                    .build()
                    .into())
            });

        let response = complete(
            &plan,
            parameters(
                SubgraphRegistry::new()
                    .with("accounts", Arc::new(accounts))
                    .with("reviews", Arc::new(reviews)),
            ),
        )
        .await;
        assert_eq!(
            response.data,
            Some(json!({ "login": { "name": "Ada" }, "review": { "body": "nice" } }))
        );
    }

    #[tokio::test]
    async fn test_subrequests_only_carry_used_variables() {
        let schema: Arc<dyn UnifiedSchema> = Arc::new(
            Supergraph::builder()
                .subgraph("accounts", ACCOUNTS)
                .subgraph("reviews", REVIEWS)
                .build()
                .unwrap(),
        );
        let operation = Operation::from_document(
            "query($id: ID!, $unused: String) { node(id: $id) { id } topReviews { body } }",
            None,
        )
        .unwrap();
        let plan = Arc::new(QueryPlanner::new(schema).plan(Arc::new(operation)).unwrap());

        let mut accounts = MockService::new();
        accounts
            .expect_execute()
            .withf(|request| {
                request.query.as_deref()
                    == Some("query($id: ID!) { node(id: $id) { ... on User { id } } }")
                    && request.variables == *json!({ "id": "1" }).as_object().unwrap()
            })
            .times(1)
            .returning(|_| {
                Ok(Response::builder()
                    .data(json!({ "node": { "id": "1" } }))
                    .build()
                    .into())
            });
        let mut reviews = MockService::new();
        reviews
            .expect_execute()
            .withf(|request| request.variables.is_empty())
            .times(1)
            .returning(|_| {
                Ok(Response::builder()
                    .data(json!({ "topReviews": [] }))
                    .build()
                    .into())
            });

        let mut parameters = parameters(
            SubgraphRegistry::new()
                .with("accounts", Arc::new(accounts))
                .with("reviews", Arc::new(reviews)),
        );
        parameters.variables = json!({ "id": "1", "unused": "x" })
            .as_object()
            .unwrap()
            .clone();
        let response = complete(&plan, parameters).await;
        assert_eq!(
            response.data,
            Some(json!({ "node": { "id": "1" }, "topReviews": [] }))
        );
    }

    #[tokio::test]
    async fn test_incremental_payloads_are_relocated() {
        let plan = plan("{ me { name reviews { body } } }");
        let accounts = MockSubgraph::builder()
            .response(
                "query { me { name } }",
                json!({ "data": { "me": { "name": "Ada" } } }),
            )
            .build();
        let reviews = MockSubgraph::builder()
            .incremental_response(
                "query { reviews { body } }",
                json!({ "data": { "reviews": [] }, "hasNext": true }),
                vec![
                    Response::builder()
                        .incremental(vec![
                            IncrementalResponse::builder()
                                .data(json!({ "body": "late", "__stitching__typename": "Review" }))
                                .path(Path::from("reviews/0"))
                                .build(),
                        ])
                        .has_next(true)
                        .build(),
                    Response::builder().has_next(false).build(),
                ],
            )
            .build();

        let result = plan
            .execute(parameters(
                SubgraphRegistry::new()
                    .with("accounts", Arc::new(accounts))
                    .with("reviews", Arc::new(reviews)),
            ))
            .await
            .unwrap();
        let ExecutionResult::Incremental {
            initial,
            subsequent,
        } = result
        else {
            panic!("expected an incremental response");
        };
        assert_eq!(initial.has_next, Some(true));
        assert_eq!(
            initial.data,
            Some(json!({ "me": { "name": "Ada", "reviews": [] } }))
        );

        let subsequent: Vec<_> = subsequent.collect().await;
        insta::assert_json_snapshot!(subsequent, @r###"
        [
          {
            "hasNext": true,
            "incremental": [
              {
                "data": {
                  "body": "late"
                },
                "path": [
                  "me",
                  "reviews",
                  0
                ]
              }
            ]
          },
          {
            "hasNext": false
          }
        ]
        "###);
    }

    #[test(tokio::test)]
    async fn test_deferred_payloads_are_stitched() {
        let plan = plan("{ topReviews { body ... @defer { author { name } } } }");
        let reviews = MockSubgraph::builder()
            .incremental_response(
                "query { topReviews { body ... @defer { author { __stitching__typename: __typename } } } }",
                json!({ "data": { "topReviews": [{ "body": "great" }] }, "hasNext": true }),
                vec![
                    Response::builder()
                        .incremental(vec![
                            IncrementalResponse::builder()
                                .data(json!({ "author": { "__stitching__typename": "User" } }))
                                .path(Path::from("topReviews/0"))
                                .build(),
                        ])
                        .has_next(false)
                        .build(),
                ],
            )
            .build();
        let accounts = MockSubgraph::builder()
            .response("query { name }", json!({ "data": { "name": "Ada" } }))
            .build();

        let result = plan
            .execute(parameters(
                SubgraphRegistry::new()
                    .with("accounts", Arc::new(accounts))
                    .with("reviews", Arc::new(reviews)),
            ))
            .await
            .unwrap();
        let ExecutionResult::Incremental {
            initial,
            subsequent,
        } = result
        else {
            panic!("expected an incremental response");
        };
        assert_eq!(
            initial.data,
            Some(json!({ "topReviews": [{ "body": "great" }] }))
        );

        let subsequent: Vec<_> = subsequent.collect().await;
        insta::assert_json_snapshot!(subsequent, @r###"
        [
          {
            "hasNext": true,
            "incremental": [
              {
                "data": {
                  "author": {
                    "name": "Ada"
                  }
                },
                "path": [
                  "topReviews",
                  0
                ]
              }
            ]
          },
          {
            "hasNext": false
          }
        ]
        "###);
    }

    #[tokio::test]
    async fn test_incremental_delivery_can_be_disabled() {
        let plan = plan("{ topReviews { body } }");
        let reviews = MockSubgraph::builder()
            .incremental_response(
                "query { topReviews { body } }",
                json!({ "data": { "topReviews": [] }, "hasNext": true }),
                vec![Response::builder().has_next(false).build()],
            )
            .build();
        let mut parameters = parameters(SubgraphRegistry::new().with("reviews", Arc::new(reviews)));
        parameters.incremental_delivery = false;

        let response = complete(&plan, parameters).await;
        assert_eq!(response.data, Some(json!({ "topReviews": [] })));
        assert_eq!(response.has_next, None);
    }

    #[tokio::test]
    async fn test_unknown_subgraph_nulls_the_root() {
        let plan = plan("{ topReviews { body } }");
        let response = complete(&plan, parameters(SubgraphRegistry::new())).await;
        assert_eq!(response.data, Some(Value::Null));
        assert_eq!(
            response.errors[0].extension_code().as_deref(),
            Some("UNKNOWN_SUBGRAPH")
        );
    }

    #[tokio::test]
    async fn test_dropping_the_execution_cancels_pending_fetches() {
        let plan = plan("{ me { name reviews { body } } }");
        let accounts = MockSubgraph::builder()
            .response(
                "query { me { name } }",
                json!({ "data": { "me": { "name": "Ada" } } }),
            )
            .build();
        let reviews = MockSubgraph::builder()
            .response("query { reviews { body } }", json!({ "data": { "reviews": [] } }))
            .delay(Duration::from_secs(3600))
            .build();
        let reviews = Arc::new(reviews);

        let execution = plan.execute(parameters(
            SubgraphRegistry::new()
                .with("accounts", Arc::new(accounts))
                .with("reviews", reviews.clone()),
        ));
        assert!(
            tokio::time::timeout(Duration::from_millis(50), execution)
                .await
                .is_err()
        );
        // give the cancelled tasks a chance to be dropped
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(reviews.requests().len(), 1);
        assert_eq!(reviews.pending(), 0);
    }

    #[tokio::test]
    async fn test_relocate_prefixes_paths_and_errors() {
        let payload = Response::builder()
            .error(
                Error::builder()
                    .message("late failure")
                    .path(Path::from("reviews/1"))
                    .build(),
            )
            .incremental(vec![
                IncrementalResponse::builder()
                    .data(json!({ "body": "x" }))
                    .build(),
            ])
            .build();
        let relocated = relocate(payload, &Path::from("me"));
        assert_eq!(relocated.errors[0].path, Some(Path::from("me/reviews/1")));
        assert_eq!(relocated.incremental[0].path, Some(Path::from("me")));
    }
}
