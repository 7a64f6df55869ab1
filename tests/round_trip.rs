// End-to-end checks against a real device.
//
// Only one Engine may exist per process, so everything that needs one runs
// inside a single test. Machines without Vulkan or without glslc skip it.

use std::path::PathBuf;

use ash::vk;
use vkcompute::backend::command::BufferRef;
use vkcompute::backend::validation::{with_policy, ValidationPolicy};
use vkcompute::backend::{
    CommandPool, CommandSink, ComputeError, Engine, EngineConfig, Fence, MemoryBuffer, Semaphore,
    ShaderModule, SubmitInfo, WAIT_FOREVER,
};
use vkcompute::compute;

fn shader_path() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("shaders/increment.comp.spv")
}

fn try_engine() -> Option<Engine> {
    let config = EngineConfig {
        app_name: "vkcompute-tests".to_string(),
        validation_layers: false,
    };
    match Engine::init(&config) {
        Ok(engine) => Some(engine),
        Err(e) => {
            eprintln!("Skipping: no usable Vulkan device ({})", e);
            None
        }
    }
}

#[test]
fn gpu_round_trip() {
    let Some(mut engine) = try_engine() else {
        return;
    };

    second_engine_is_refused();
    host_buffer_round_trip(&engine);
    fence_states(&engine);
    preconditions_are_errors_under_trust(&engine);
    semaphore_orders_two_submissions(&engine);

    let shader = shader_path();
    if shader.exists() {
        let input: Vec<u32> = (0..60).collect();
        let output = compute::run_shader(&engine, &shader, &input, WAIT_FOREVER).unwrap();
        let expected: Vec<u32> = (1..=60).collect();
        assert_eq!(output, expected);

        // Spans several workgroups with a partial last one
        let input: Vec<u32> = (0..1000).collect();
        let output = compute::run_shader(&engine, &shader, &input, WAIT_FOREVER).unwrap();
        assert_eq!(output, (1..=1000).collect::<Vec<u32>>());

        torn_down_shader_is_refused(&engine);
    } else {
        eprintln!("Skipping dispatch: {:?} not compiled", shader);
    }

    engine.deinit();
    assert!(!engine.is_initialized());

    // The slot is free again
    let mut again = try_engine().expect("engine re-initializes after deinit");
    again.deinit();
}

fn second_engine_is_refused() {
    let result = with_policy(ValidationPolicy::Trust, || Engine::init(&EngineConfig::default()));
    assert!(matches!(result, Err(ComputeError::AlreadyInitialized)));
}

fn host_buffer_round_trip(engine: &Engine) {
    let pattern: Vec<u8> = (0..=255u8).cycle().take(1024).collect();

    let mut buffer = MemoryBuffer::new(
        engine.device(),
        engine.memory_properties(),
        vk::BufferUsageFlags::TRANSFER_SRC | vk::BufferUsageFlags::TRANSFER_DST,
        vk::MemoryPropertyFlags::HOST_VISIBLE,
        pattern.len() as vk::DeviceSize,
    )
    .unwrap();

    buffer.write_data(&pattern).unwrap();
    buffer.flush_write().unwrap();

    let first: Vec<u8> = buffer.extract_data().unwrap();
    let second: Vec<u8> = buffer.extract_data().unwrap();
    assert_eq!(first, pattern);
    assert_eq!(second, pattern);

    let words: Vec<u32> = buffer.extract_data().unwrap();
    assert_eq!(words.len(), pattern.len() / 4);
    assert_eq!(words[0], u32::from_le_bytes([0, 1, 2, 3]));

    buffer.deinit();
    assert!(!buffer.is_initialized());
    assert_eq!(buffer.size(), 0);
}

fn fence_states(engine: &Engine) {
    let device = engine.device();

    let signaled = Fence::new_signaled(device).unwrap();
    assert!(signaled.is_signaled().unwrap());
    signaled.wait_and_reset(WAIT_FOREVER).unwrap();
    assert!(!signaled.is_signaled().unwrap());

    let pending = Fence::new(device).unwrap();
    let err = pending.wait(1_000).unwrap_err();
    assert!(err.is_timeout());

    let batch = [
        Fence::new_signaled(device).unwrap(),
        Fence::new_signaled(device).unwrap(),
    ];
    Fence::wait_all_and_reset(&batch, WAIT_FOREVER).unwrap();
    assert!(!batch[0].is_signaled().unwrap());
    assert!(!batch[1].is_signaled().unwrap());
}

fn host_buffer(engine: &Engine, size: vk::DeviceSize) -> MemoryBuffer {
    MemoryBuffer::new(
        engine.device(),
        engine.memory_properties(),
        vk::BufferUsageFlags::TRANSFER_SRC | vk::BufferUsageFlags::TRANSFER_DST,
        vk::MemoryPropertyFlags::HOST_VISIBLE,
        size,
    )
    .unwrap()
}

fn preconditions_are_errors_under_trust(engine: &Engine) {
    with_policy(ValidationPolicy::Trust, || {
        let mut buffer = host_buffer(engine, 16);
        let short = buffer.write_data(&[0u8; 8]);
        assert!(matches!(short, Err(ComputeError::Precondition(_))));
        let long = buffer.write_data(&[0u8; 24]);
        assert!(matches!(long, Err(ComputeError::Precondition(_))));

        let mut odd = host_buffer(engine, 10);
        let partial = odd.extract_data::<u32>();
        assert!(matches!(partial, Err(ComputeError::Precondition(_))));

        let pool = CommandPool::new(engine.device(), engine.queue_family_index()).unwrap();
        let none = pool.allocate_command_buffers(0, true);
        assert!(matches!(none, Err(ComputeError::Precondition(_))));

        let semaphore = Semaphore::new(engine.device()).unwrap();
        let fence = Fence::new(engine.device()).unwrap();
        let waits = [&semaphore];
        let lopsided = SubmitInfo::new(&[]).wait_on(&waits, &[]);
        let submitted = engine.queue().submit(&[lopsided], &fence);
        assert!(matches!(submitted, Err(ComputeError::Precondition(_))));

        // A freed command buffer refuses further recording
        let mut recorders = pool.allocate_command_buffers(1, true).unwrap();
        let recorder = &mut recorders[0];
        recorder.deinit();
        let begun = recorder.begin(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        assert!(matches!(begun, Err(ComputeError::Precondition(_))));
        let target = BufferRef::from(&buffer);
        let copied = recorder.copy_buffer(target, target);
        assert!(matches!(copied, Err(ComputeError::Precondition(_))));
        assert!(matches!(recorder.dispatch_x(1), Err(ComputeError::Precondition(_))));
    });
}

fn semaphore_orders_two_submissions(engine: &Engine) {
    let device = engine.device();
    let pattern: Vec<u32> = (100..164).collect();
    let size = std::mem::size_of_val(pattern.as_slice()) as vk::DeviceSize;

    let mut upload = host_buffer(engine, size);
    upload.write_slice(&pattern).unwrap();
    upload.flush_write().unwrap();
    let mut readback = host_buffer(engine, size);
    let staging = MemoryBuffer::new(
        device,
        engine.memory_properties(),
        vk::BufferUsageFlags::TRANSFER_SRC | vk::BufferUsageFlags::TRANSFER_DST,
        vk::MemoryPropertyFlags::DEVICE_LOCAL,
        size,
    )
    .unwrap();

    let pool = CommandPool::new(device, engine.queue_family_index()).unwrap();
    let mut recorders = pool.allocate_command_buffers(2, true).unwrap();
    {
        let [first, second] = recorders.as_mut_slice() else {
            panic!("expected two command buffers");
        };

        first.begin(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT).unwrap();
        first
            .copy_buffer(BufferRef::from(&upload), BufferRef::from(&staging))
            .unwrap();
        first.end().unwrap();

        second.begin(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT).unwrap();
        second
            .copy_buffer(BufferRef::from(&staging), BufferRef::from(&readback))
            .unwrap();
        let to_host = vk::BufferMemoryBarrier::builder()
            .src_access_mask(vk::AccessFlags::TRANSFER_WRITE)
            .dst_access_mask(vk::AccessFlags::HOST_READ)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .buffer(readback.native())
            .size(vk::WHOLE_SIZE)
            .build();
        second
            .pipeline_barrier(
                vk::PipelineStageFlags::TRANSFER,
                vk::PipelineStageFlags::HOST,
                vk::DependencyFlags::empty(),
                &[],
                &[to_host],
                &[],
            )
            .unwrap();
        second.end().unwrap();

        let semaphore = Semaphore::new(device).unwrap();
        let fence = Fence::new(device).unwrap();
        let signals = [&semaphore];
        let stages = [vk::PipelineStageFlags::TRANSFER];
        let first_batch = [&*first];
        let second_batch = [&*second];

        engine
            .queue()
            .submit(
                &[
                    SubmitInfo::new(&first_batch).signal(&signals),
                    SubmitInfo::new(&second_batch).wait_on(&signals, &stages),
                ],
                &fence,
            )
            .unwrap();
        fence.wait(WAIT_FOREVER).unwrap();
    }

    assert_eq!(readback.extract_data::<u32>().unwrap(), pattern);

    for recorder in &mut recorders {
        recorder.deinit();
    }
}

fn torn_down_shader_is_refused(engine: &Engine) {
    let mut shader = ShaderModule::from_file(engine.device(), shader_path()).unwrap();
    shader.deinit();

    let stage = with_policy(ValidationPolicy::Trust, || {
        shader.stage_create_info(vk::ShaderStageFlags::COMPUTE, c"main", None)
    });
    assert!(matches!(stage, Err(ComputeError::Precondition(_))));
}
