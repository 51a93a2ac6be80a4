#![allow(dead_code)]

use std::cell::Cell;
use std::io;
use std::rc::Rc;

use rip_dlspill::{
    BBox, ChainId, ChannelFactory, DiskChannel, DisplayListStore, DisplayObject, FillMesh,
    GouraudMesh, GouraudVertex, MemoryChannel, PageOptions, Point, SpillConfig,
};

pub fn memory_factory() -> ChannelFactory {
    Box::new(|| Ok(Box::new(MemoryChannel::new()) as Box<dyn DiskChannel>))
}

/// A store on an in-memory channel with a page already started.
pub fn store_with(config: SpillConfig) -> DisplayListStore {
    let mut store = DisplayListStore::with_channel_factory(config, memory_factory());
    store.notify_page_reset(PageOptions::default());
    store
}

pub fn store() -> DisplayListStore {
    store_with(SpillConfig::default())
}

pub fn capped(cap: usize) -> SpillConfig {
    SpillConfig {
        aggregate_cap: cap,
        ..SpillConfig::default()
    }
}

pub fn bbox(i: usize) -> BBox {
    let i = i as i32;
    BBox::new(i, i * 2, i + 10, i * 2 + 10)
}

pub fn rect(i: usize) -> DisplayObject {
    DisplayObject::rect(bbox(i))
}

pub fn fill_mesh(seed: usize, threads: usize) -> FillMesh {
    let mut mesh = FillMesh::new();
    for thread in 0..threads {
        let base = (seed * 100 + thread * 10) as i32;
        let points: Vec<Point> = (0..4).map(|k| Point::new(base + k, base - k)).collect();
        mesh.push_thread(&points, if thread % 2 == 0 { 1 } else { -1 });
    }
    mesh
}

pub fn gouraud_mesh(shade: u16, triangles: usize) -> GouraudMesh {
    let vertices = (0..triangles + 2)
        .map(|i| GouraudVertex {
            x: i as i32 * 7,
            y: i as i32 * 3,
            color: [shade, shade / 2, 0, u16::MAX],
        })
        .collect();
    let triangles = (0..triangles as u32).map(|i| [i, i + 1, i + 2]).collect();
    GouraudMesh {
        vertices,
        triangles,
    }
}

/// A fresh chain holding `objects` in order.
pub fn chain_of(
    store: &mut DisplayListStore,
    objects: impl IntoIterator<Item = DisplayObject>,
) -> ChainId {
    let chain = store.create_chain().unwrap();
    for object in objects {
        store.append(chain, object).unwrap();
    }
    chain
}

/// In-memory channel whose every call fails while `fail` is set.
pub struct FlakyChannel {
    inner: MemoryChannel,
    fail: Rc<Cell<bool>>,
}

impl FlakyChannel {
    fn check(&self) -> io::Result<()> {
        if self.fail.get() {
            return Err(io::Error::other("injected scratch failure"));
        }
        Ok(())
    }
}

impl DiskChannel for FlakyChannel {
    fn seek(&mut self, offset: u64) -> io::Result<()> {
        self.check()?;
        self.inner.seek(offset)
    }

    fn read_exact(&mut self, buf: &mut [u8]) -> io::Result<()> {
        self.check()?;
        self.inner.read_exact(buf)
    }

    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        self.check()?;
        self.inner.write_all(buf)
    }

    fn close(&mut self) -> io::Result<()> {
        self.check()?;
        self.inner.close()
    }
}

pub fn flaky_store(config: SpillConfig, fail: &Rc<Cell<bool>>) -> DisplayListStore {
    let fail = Rc::clone(fail);
    let mut store = DisplayListStore::with_channel_factory(
        config,
        Box::new(move || {
            Ok(Box::new(FlakyChannel {
                inner: MemoryChannel::new(),
                fail: Rc::clone(&fail),
            }) as Box<dyn DiskChannel>)
        }),
    );
    store.notify_page_reset(PageOptions::default());
    store
}
