use futures::future::BoxFuture;

use crate::{
    command::{Command, CommandResult},
    error::Result,
    selector::{self, Mapping, Selection},
    stage::{Component, FrameStage, PacketStage, StreamType, Tagged, Transformer},
    stream::StreamParameters,
};

/// Drops and relabels substreams of its input.
pub struct Select<S: Transformer> {
    component: Component,
    upstream: Box<S>,
    input_streams: Vec<StreamParameters>,
    mapping: Mapping,
    streams: Vec<StreamParameters>,
    closed: bool,
}

pub type PacketSelector = Select<PacketStage>;
pub type FrameSelector = Select<FrameStage>;

impl<S> Select<S>
where
    S: Transformer,
    S::Item: Tagged,
{
    async fn open(component: Component, mut upstream: S, selection: &Selection) -> Result<Self> {
        let input_streams = upstream.streams().await?;
        let mapping = selector::resolve(&input_streams, selection)?;
        let streams = selector::mapped_streams(&input_streams, &mapping);
        log::info!("{:?}: mapping {:?}", component, mapping);
        Ok(Self {
            component,
            upstream: Box::new(upstream),
            input_streams,
            mapping,
            streams,
            closed: false,
        })
    }

    pub fn mapping(&self) -> &Mapping {
        &self.mapping
    }

    fn reselect(&mut self, selection: &Selection) -> Result<()> {
        let mapping = selector::resolve(&self.input_streams, selection)?;
        self.streams = selector::mapped_streams(&self.input_streams, &mapping);
        self.mapping = mapping;
        log::debug!("{:?}: reselected {:?}", self.component, self.mapping);
        Ok(())
    }

    async fn pull(&mut self) -> Result<Option<Vec<S::Item>>> {
        loop {
            let Some(batch) = self.upstream.next_batch().await? else {
                return Ok(None);
            };
            if batch.is_empty() {
                return Ok(Some(batch));
            }
            let kept: Vec<S::Item> = batch
                .into_iter()
                .filter_map(|mut unit| {
                    let out = self.mapping.get(unit.stream_index()).copied().flatten()?;
                    unit.set_stream_index(out);
                    Some(unit)
                })
                .collect();
            if !kept.is_empty() {
                return Ok(Some(kept));
            }
        }
    }
}

impl PacketSelector {
    pub async fn new(upstream: PacketStage, selection: &Selection) -> Result<Self> {
        Self::open(Component::PacketSelector, upstream, selection).await
    }
}

impl FrameSelector {
    pub async fn new(upstream: FrameStage, selection: &Selection) -> Result<Self> {
        Self::open(Component::FrameSelector, upstream, selection).await
    }
}

impl<S> Transformer for Select<S>
where
    S: Transformer,
    S::Item: Tagged,
{
    type Item = S::Item;

    fn component(&self) -> Component {
        self.component
    }

    fn stream_type(&self) -> StreamType {
        self.upstream.stream_type()
    }

    fn ptr(&self) -> bool {
        self.upstream.ptr()
    }

    fn streams(&mut self) -> BoxFuture<'_, Result<Vec<StreamParameters>>> {
        Box::pin(async move { Ok(self.streams.clone()) })
    }

    fn next_batch(&mut self) -> BoxFuture<'_, Result<Option<Vec<S::Item>>>> {
        Box::pin(async move {
            if self.closed {
                return Ok(None);
            }
            let res = self.pull().await;
            if !matches!(res, Ok(Some(_))) {
                self.closed = true;
            }
            res
        })
    }

    fn apply_commands<'a>(
        &'a mut self,
        commands: &'a [Command],
        results: &'a mut [CommandResult],
    ) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            for (cmd, result) in commands.iter().zip(results.iter_mut()) {
                if let Command::Reselect { selection } = cmd {
                    if result.ran {
                        continue;
                    }
                    match self.reselect(selection) {
                        Ok(()) => result.ok(),
                        Err(e) => result.fail(e),
                    }
                }
            }
            self.upstream.apply_commands(commands, results).await;
        })
    }
}

#[cfg(test)]
#[path = "selector_test.rs"]
mod selector_test;
