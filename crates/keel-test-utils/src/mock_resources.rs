//! Mock resource types with tiny binary formats.

use keel_resources::prelude::*;

/// A texture that streams in one mip level per content update, coarsest first.
///
/// Format: `b"TEX1"`, one byte with the mip count, then per mip a little-endian `u32`
/// length followed by that many bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestTexture {
    mips: Vec<Vec<u8>>,
    total_mips: u32,
    placeholder: bool,
}

impl TestTexture {
    const MAGIC: &'static [u8; 4] = b"TEX1";

    /// Encode mips, coarsest first.
    pub fn encode(mips: &[&[u8]]) -> Vec<u8> {
        let mut bytes = Self::MAGIC.to_vec();
        bytes.push(mips.len() as u8);
        for mip in mips {
            bytes.extend_from_slice(&(mip.len() as u32).to_le_bytes());
            bytes.extend_from_slice(mip);
        }
        bytes
    }

    fn decode(bytes: &[u8]) -> Result<Vec<&[u8]>, String> {
        let rest = bytes
            .strip_prefix(Self::MAGIC.as_slice())
            .ok_or_else(|| "bad magic".to_string())?;
        let (&count, mut rest) = rest.split_first().ok_or("missing mip count")?;
        if count == 0 {
            return Err("texture without mips".to_string());
        }

        let mut mips = Vec::with_capacity(count as usize);
        for i in 0..count {
            if rest.len() < 4 {
                return Err(format!("truncated length of mip {}", i));
            }
            let (len, tail) = rest.split_at(4);
            let len = u32::from_le_bytes([len[0], len[1], len[2], len[3]]) as usize;
            if tail.len() < len {
                return Err(format!("truncated mip {}", i));
            }
            let (mip, tail) = tail.split_at(len);
            mips.push(mip);
            rest = tail;
        }
        Ok(mips)
    }

    pub fn mip_count(&self) -> u32 {
        self.mips.len() as u32
    }

    pub fn total_mips(&self) -> u32 {
        self.total_mips
    }

    pub fn mip(&self, level: usize) -> Option<&[u8]> {
        self.mips.get(level).map(Vec::as_slice)
    }

    pub fn is_placeholder(&self) -> bool {
        self.placeholder
    }

    fn desc(&self) -> LoadDesc {
        let loaded = self.mip_count();
        LoadDesc::partial(loaded, self.total_mips - loaded)
    }
}

impl Loadable for TestTexture {
    type Descriptor = Vec<Vec<u8>>;

    fn update_content(previous: Option<&Self>, ctx: LoadContext<'_>) -> ResourceResult<Loaded<Self>> {
        let mips = Self::decode(ctx.bytes()).map_err(|e| ctx.malformed(e))?;

        let mut texture = match previous {
            Some(previous) if !previous.placeholder => previous.clone(),
            _ => TestTexture {
                mips: Vec::new(),
                total_mips: mips.len() as u32,
                placeholder: false,
            },
        };
        texture.total_mips = mips.len() as u32;
        texture.mips.truncate(mips.len());

        // One more level per update
        if let Some(next) = mips.get(texture.mips.len()) {
            texture.mips.push(next.to_vec());
        }

        let desc = texture.desc();
        Ok(Loaded::new(texture, desc))
    }

    fn create_resource(mips: Vec<Vec<u8>>) -> ResourceResult<Loaded<Self>> {
        let texture = TestTexture {
            total_mips: mips.len() as u32,
            mips,
            placeholder: false,
        };
        let desc = texture.desc();
        Ok(Loaded::new(texture, desc))
    }

    fn unload_data(&mut self, what: Unload) -> LoadDesc {
        match what {
            Unload::AllQualityLevels => self.mips.clear(),
            Unload::OneQualityLevel => {
                self.mips.pop();
            }
        }
        self.desc()
    }
}

impl MemoryReportable for TestTexture {
    fn memory_usage(&self) -> MemoryUsage {
        MemoryUsage::new(0, self.mips.iter().map(|mip| mip.len() as u64).sum())
    }
}

impl Resource for TestTexture {
    fn type_name() -> &'static str {
        "TestTexture"
    }

    fn placeholder() -> Option<Self> {
        Some(TestTexture {
            mips: vec![vec![0xFF, 0x00, 0xFF, 0xFF]],
            total_mips: 1,
            placeholder: true,
        })
    }
}

/// Descriptor accepted by [`TestMesh`]'s `create_resource`.
#[derive(Debug, Clone, Copy)]
pub struct MeshDescriptor {
    pub vertex_count: u32,
}

/// A mesh with a single quality level.
///
/// Format: `b"MESH"` followed by a little-endian `u32` vertex count.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestMesh {
    pub vertex_count: u32,
}

impl TestMesh {
    const MAGIC: &'static [u8; 4] = b"MESH";
    const VERTEX_SIZE: u64 = 32;

    pub fn encode(vertex_count: u32) -> Vec<u8> {
        let mut bytes = Self::MAGIC.to_vec();
        bytes.extend_from_slice(&vertex_count.to_le_bytes());
        bytes
    }
}

impl Loadable for TestMesh {
    type Descriptor = MeshDescriptor;

    fn update_content(_previous: Option<&Self>, ctx: LoadContext<'_>) -> ResourceResult<Loaded<Self>> {
        let rest = ctx
            .bytes()
            .strip_prefix(Self::MAGIC.as_slice())
            .ok_or_else(|| ctx.malformed("bad magic"))?;
        let count: [u8; 4] = rest
            .try_into()
            .map_err(|_| ctx.malformed("expected a 4-byte vertex count"))?;
        Ok(Loaded::complete(TestMesh {
            vertex_count: u32::from_le_bytes(count),
        }))
    }

    fn create_resource(descriptor: MeshDescriptor) -> ResourceResult<Loaded<Self>> {
        Ok(Loaded::complete(TestMesh {
            vertex_count: descriptor.vertex_count,
        }))
    }
}

impl MemoryReportable for TestMesh {
    fn memory_usage(&self) -> MemoryUsage {
        let bytes = u64::from(self.vertex_count) * Self::VERTEX_SIZE;
        MemoryUsage::new(bytes, bytes)
    }
}

impl Resource for TestMesh {
    fn type_name() -> &'static str {
        "TestMesh"
    }
}

/// Shader source that has to be compiled on the main thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestShader {
    pub source: String,
    /// The thread `update_content` ran on.
    pub compiled_on: Option<String>,
}

impl Loadable for TestShader {
    type Descriptor = String;

    fn update_content(_previous: Option<&Self>, ctx: LoadContext<'_>) -> ResourceResult<Loaded<Self>> {
        let source = std::str::from_utf8(ctx.bytes())
            .map_err(|e| ctx.malformed(format!("shader is not UTF-8: {}", e)))?;
        Ok(Loaded::complete(TestShader {
            source: source.to_string(),
            compiled_on: std::thread::current().name().map(str::to_string),
        }))
    }

    fn create_resource(source: String) -> ResourceResult<Loaded<Self>> {
        Ok(Loaded::complete(TestShader {
            source,
            compiled_on: None,
        }))
    }
}

impl MemoryReportable for TestShader {
    fn memory_usage(&self) -> MemoryUsage {
        MemoryUsage::new(self.source.len() as u64, 0)
    }
}

impl Resource for TestShader {
    const UPDATE_AFFINITY: UpdateAffinity = UpdateAffinity::MainThread;

    fn type_name() -> &'static str {
        "TestShader"
    }
}
